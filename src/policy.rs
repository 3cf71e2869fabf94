//! Per-field cache policy.
//!
//! [`PolicyConfig`] is what a user registers for a field. It is validated and merged over the process-wide defaults
//! into an immutable [`Policy`] once, at registration time.

use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::error::ConfigError;
use crate::traits::Storage;
use crate::types::BoxFuture;
use crate::types::FieldCall;
use crate::types::FieldIdentity;

pub type SkipFn<C> = Arc<dyn Fn(Arc<FieldCall<C>>) -> BoxFuture<'static, anyhow::Result<bool>> + Send + Sync>;
pub type KeyFn<C> = Arc<dyn Fn(&FieldCall<C>) -> anyhow::Result<String> + Send + Sync>;
pub type ExtendKeyFn<C> = Arc<dyn Fn(&FieldCall<C>) -> anyhow::Result<Option<String>> + Send + Sync>;
/// Used both for `references` (tags of a fresh result) and `invalidate` (references a mutation purges). Receives the
/// call and its successful result.
pub type ReferencesFn<C> =
    Arc<dyn Fn(Arc<FieldCall<C>>, Value) -> BoxFuture<'static, anyhow::Result<Vec<String>>> + Send + Sync>;
pub type TtlFn = Arc<dyn Fn(&Value) -> f64 + Send + Sync>;

/// Wrap an async predicate into a [`SkipFn`]. Used for the process-wide default predicate.
pub fn skip_fn<C, F, Fut>(f: F) -> SkipFn<C>
where
    C: Send + Sync + 'static,
    F: Fn(Arc<FieldCall<C>>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
{
    Arc::new(move |call: Arc<FieldCall<C>>| Box::pin(f(call)) as BoxFuture<'static, _>)
}

#[derive(Clone)]
pub enum Ttl {
    Seconds(f64),
    /// Computed from the result of the call. Non-positive values mean "do not cache this result".
    Dynamic(TtlFn),
}

impl Ttl {
    pub fn for_value(&self, value: &Value) -> Duration {
        let secs = match self {
            Self::Seconds(secs) => *secs,
            Self::Dynamic(f) => f(value),
        };
        seconds(secs)
    }

    pub fn is_zero(&self) -> bool {
        matches!(self, Self::Seconds(secs) if *secs <= 0.0)
    }
}

impl From<f64> for Ttl {
    fn from(secs: f64) -> Self {
        Self::Seconds(secs)
    }
}

impl From<u64> for Ttl {
    fn from(secs: u64) -> Self {
        Self::Seconds(secs as f64)
    }
}

impl From<Duration> for Ttl {
    fn from(ttl: Duration) -> Self {
        Self::Seconds(ttl.as_secs_f64())
    }
}

impl Debug for Ttl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Seconds(secs) => write!(f, "Ttl::Seconds({secs})"),
            Self::Dynamic(_) => write!(f, "Ttl::Dynamic"),
        }
    }
}

/// Negative and non-finite seconds collapse to zero. Values too large for a `Duration` saturate.
pub(crate) fn seconds(secs: f64) -> Duration {
    if secs.is_finite() && secs > 0.0 {
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
    else {
        Duration::ZERO
    }
}

pub enum KeyMode<C> {
    /// Selection-aware default key, optionally extended from the call context.
    Default { extend: Option<ExtendKeyFn<C>> },
    /// The function's output is used verbatim after the field identity prefix.
    Custom(KeyFn<C>),
}

impl<C> Clone for KeyMode<C> {
    fn clone(&self) -> Self {
        match self {
            Self::Default { extend } => Self::Default { extend: extend.clone() },
            Self::Custom(f) => Self::Custom(f.clone()),
        }
    }
}

/// Field-level overrides as registered by the user.
pub struct PolicyConfig<C> {
    ttl:        Option<Ttl>,
    stale:      Option<f64>,
    storage:    Option<String>,
    skip:       Option<SkipFn<C>>,
    key:        Option<KeyFn<C>>,
    extend_key: Option<ExtendKeyFn<C>>,
    references: Option<ReferencesFn<C>>,
    invalidate: Option<ReferencesFn<C>>,
}

impl<C> Default for PolicyConfig<C> {
    fn default() -> Self {
        Self {
            ttl:        None,
            stale:      None,
            storage:    None,
            skip:       None,
            key:        None,
            extend_key: None,
            references: None,
            invalidate: None,
        }
    }
}

impl<C> PolicyConfig<C>
where
    C: Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ttl(mut self, ttl: impl Into<Ttl>) -> Self {
        self.ttl = Some(ttl.into());
        self
    }

    pub fn ttl_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> f64 + Send + Sync + 'static,
    {
        self.ttl = Some(Ttl::Dynamic(Arc::new(f)));
        self
    }

    pub fn stale(mut self, secs: f64) -> Self {
        self.stale = Some(secs);
        self
    }

    pub fn storage(mut self, name: impl Into<String>) -> Self {
        self.storage = Some(name.into());
        self
    }

    pub fn skip<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<FieldCall<C>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        self.skip = Some(skip_fn(f));
        self
    }

    pub fn key<F>(mut self, f: F) -> Self
    where
        F: Fn(&FieldCall<C>) -> anyhow::Result<String> + Send + Sync + 'static,
    {
        self.key = Some(Arc::new(f));
        self
    }

    pub fn extend_key<F>(mut self, f: F) -> Self
    where
        F: Fn(&FieldCall<C>) -> anyhow::Result<Option<String>> + Send + Sync + 'static,
    {
        self.extend_key = Some(Arc::new(f));
        self
    }

    pub fn references<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<FieldCall<C>>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Vec<String>>> + Send + 'static,
    {
        self.references = Some(Arc::new(move |call: Arc<FieldCall<C>>, value: Value| {
            Box::pin(f(call, value)) as BoxFuture<'static, _>
        }));
        self
    }

    pub fn invalidate<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<FieldCall<C>>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Vec<String>>> + Send + 'static,
    {
        self.invalidate = Some(Arc::new(move |call: Arc<FieldCall<C>>, value: Value| {
            Box::pin(f(call, value)) as BoxFuture<'static, _>
        }));
        self
    }

    /// Validate and merge over `defaults`. Storage names are resolved against `storages`.
    pub(crate) fn resolve(
        self,
        identity: FieldIdentity,
        defaults: &PolicyDefaults<C>,
        storages: &HashMap<String, Arc<dyn Storage>>,
    ) -> Result<Policy<C>, ConfigError> {
        if let Some(Ttl::Seconds(secs)) = self.ttl {
            if !secs.is_finite() || secs < 0.0 {
                return Err(ConfigError::InvalidTtl {
                    field: identity.to_string(),
                    value: secs,
                });
            }
        }

        let stale = self.stale.unwrap_or(defaults.stale);
        if !stale.is_finite() || stale < 0.0 {
            return Err(ConfigError::InvalidStale {
                field: identity.to_string(),
                value: stale,
            });
        }

        if self.key.is_some() && self.extend_key.is_some() {
            return Err(ConfigError::KeyConflict(identity));
        }

        if self.storage.is_some() && self.ttl.is_none() && defaults.ttl <= 0.0 {
            return Err(ConfigError::StorageWithoutTtl(identity));
        }

        let storage_name = self.storage.unwrap_or_else(|| defaults.storage.clone());
        let storage = storages
            .get(&storage_name)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownStorage(storage_name.clone()))?;

        let key_mode = match self.key {
            Some(key) => KeyMode::Custom(key),
            None => KeyMode::Default {
                extend: self.extend_key,
            },
        };

        Ok(Policy {
            identity,
            ttl: self.ttl.unwrap_or(Ttl::Seconds(defaults.ttl)),
            stale: seconds(stale),
            storage_name,
            storage,
            skip: self.skip.or_else(|| defaults.skip.clone()),
            key_mode,
            references: self.references,
            invalidate: self.invalidate,
        })
    }
}

/// Process-wide values a field policy falls back to.
pub(crate) struct PolicyDefaults<C> {
    pub(crate) ttl:     f64,
    pub(crate) stale:   f64,
    pub(crate) storage: String,
    pub(crate) skip:    Option<SkipFn<C>>,
}

/// The effective, validated policy of a single field.
pub struct Policy<C> {
    identity:     FieldIdentity,
    ttl:          Ttl,
    stale:        Duration,
    storage_name: String,
    storage:      Arc<dyn Storage>,
    skip:         Option<SkipFn<C>>,
    key_mode:     KeyMode<C>,
    references:   Option<ReferencesFn<C>>,
    invalidate:   Option<ReferencesFn<C>>,
}

impl<C> Policy<C> {
    /// Policy synthesized for a field that has no explicit configuration while all fields are cached.
    pub(crate) fn synthesized(identity: FieldIdentity, defaults: &PolicyDefaults<C>, storage: Arc<dyn Storage>) -> Self {
        Self {
            identity,
            ttl: Ttl::Seconds(defaults.ttl),
            stale: seconds(defaults.stale),
            storage_name: defaults.storage.clone(),
            storage,
            skip: defaults.skip.clone(),
            key_mode: KeyMode::Default { extend: None },
            references: None,
            invalidate: None,
        }
    }

    pub fn identity(&self) -> &FieldIdentity {
        &self.identity
    }

    pub fn ttl(&self) -> &Ttl {
        &self.ttl
    }

    pub fn stale(&self) -> Duration {
        self.stale
    }

    pub fn storage_name(&self) -> &str {
        &self.storage_name
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn skip_fn(&self) -> Option<&SkipFn<C>> {
        self.skip.as_ref()
    }

    pub fn key_mode(&self) -> &KeyMode<C> {
        &self.key_mode
    }

    pub fn references_fn(&self) -> Option<&ReferencesFn<C>> {
        self.references.as_ref()
    }

    pub fn invalidate_fn(&self) -> Option<&ReferencesFn<C>> {
        self.invalidate.as_ref()
    }
}

impl<C> Debug for Policy<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Policy")
            .field("identity", &self.identity)
            .field("ttl", &self.ttl)
            .field("stale", &self.stale)
            .field("storage", &self.storage_name)
            .field("skip", &self.skip.is_some())
            .field("custom_key", &matches!(self.key_mode, KeyMode::Custom(_)))
            .field("references", &self.references.is_some())
            .field("invalidate", &self.invalidate.is_some())
            .finish()
    }
}
