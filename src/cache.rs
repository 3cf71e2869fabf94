use std::collections::HashMap;
use std::future::Future;
use std::panic::catch_unwind;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use fieldx::fxstruct;
use garde::Validate;
use parking_lot::Mutex;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::trace;
use tracing::warn;

use crate::entry::CacheEntry;
use crate::entry::Freshness;
use crate::error::CacheError;
use crate::error::ConfigError;
use crate::error::FieldResult;
use crate::inflight::FlightGuard;
use crate::inflight::InFlight;
use crate::inflight::Slot;
use crate::invalidation::GcMode;
use crate::invalidation::GcReport;
use crate::invalidation::IntoReferences;
use crate::key;
use crate::options::CacheOptions;
use crate::policy::KeyMode;
use crate::policy::Policy;
use crate::policy::PolicyConfig;
use crate::policy::PolicyDefaults;
use crate::policy::SkipFn;
use crate::registry::Fallback;
use crate::registry::PolicyRegistry;
use crate::report::Notifier;
use crate::report::Report;
use crate::storage::MemoryStorage;
use crate::storage::DEFAULT_STORAGE;
use crate::traits::Observer;
use crate::traits::Storage;
use crate::types::FieldCall;
use crate::types::FieldIdentity;

pub type FlushFn = Arc<dyn Fn(&Report) + Send + Sync>;

/// What the interception layer holds on to for a cached field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldHandle {
    identity: FieldIdentity,
}

impl FieldHandle {
    pub fn new(identity: FieldIdentity) -> Self {
        Self { identity }
    }

    pub fn identity(&self) -> &FieldIdentity {
        &self.identity
    }
}

impl From<FieldIdentity> for FieldHandle {
    fn from(identity: FieldIdentity) -> Self {
        Self::new(identity)
    }
}

async fn run<C, F, Fut>(compute: F, call: Arc<FieldCall<C>>) -> FieldResult
where
    F: FnOnce(Arc<FieldCall<C>>) -> Fut,
    Fut: Future<Output = anyhow::Result<Value>>,
{
    compute(call).await.map_err(Arc::new)
}

fn deliver(callbacks: &Mutex<Vec<FlushFn>>, report: &Report) {
    // Clone the list so that a callback is free to register another one.
    let callbacks = callbacks.lock().clone();
    for callback in callbacks {
        if catch_unwind(AssertUnwindSafe(|| callback(report))).is_err() {
            warn!("report callback panicked");
        }
    }
}

/// The field cache.
///
/// Every call of a cached field goes through [`invoke()`](Self::invoke) which decides whether the result is served
/// from a storage, joins an identical call already in progress, or runs the computation and stores its result.
///
/// ```ignore
/// let cache = Cache::<AppContext>::builder()
///     .ttl(30.0)
///     .stale(5.0)
///     .default_storage(Arc::new(MemoryStorage::builder().invalidation(true).build()?))
///     .build()?;
///
/// let user = cache.define_policy(
///     FieldIdentity::new("Query", "user"),
///     PolicyConfig::new().references(|_, value| async move { Ok(vec![format!("user:{}", value["id"])]) }),
/// )?;
///
/// let call = FieldCall::new(ctx).with_args(json!({"id": 42})).with_requested_fields(["id", "name"]);
/// let value = cache.invoke(&user, call, |call| async move { load_user(call.args()).await }).await?;
/// ```
///
/// Failures of the caching machinery never reach the caller: they are logged, counted, passed on to the
/// [`Observer`], and the call falls back to direct computation.
#[fxstruct(
    no_new,
    default(off),
    sync,
    builder(
        doc("Builder object of [`Cache`].", "", "See [`Cache::builder()`] method."),
        method_doc("Implement builder pattern for [`Cache`]."),
    )
)]
pub struct Cache<C>
where
    C: Send + Sync + 'static,
{
    /// Default time to live, seconds. Zero means that only fields with their own ttl are cached.
    #[fieldx(get(copy), default(0.0))]
    ttl: f64,

    /// Default stale window, seconds.
    #[fieldx(get(copy), default(0.0))]
    stale: f64,

    /// Cache every field even if no policy has been defined for it.
    #[fieldx(get(copy), default(false))]
    all: bool,

    /// How often [`spawn_reporter()`](Self::spawn_reporter) flushes the counters. Without it reporting is disabled.
    #[fieldx(optional, get(copy))]
    report_interval: Duration,

    #[fieldx(optional, get(clone))]
    observer: Arc<dyn Observer>,

    /// Process-wide skip predicate. See [`skip_fn()`](crate::policy::skip_fn).
    #[fieldx(optional, get(off))]
    skip: SkipFn<C>,

    /// Registered as `"default"`. An in-process storage with default settings is used if none is given.
    #[fieldx(optional, get(off))]
    default_storage: Arc<dyn Storage>,

    #[fieldx(lazy, private, get(clone), builder(off))]
    storages: Arc<RwLock<HashMap<String, Arc<dyn Storage>>>>,

    #[fieldx(lazy, private, get(clone), builder(off))]
    registry: Arc<PolicyRegistry<C>>,

    #[fieldx(lazy, private, get(clone), builder(off))]
    notifier: Arc<Notifier>,

    #[fieldx(private, get(clone), builder(off), default(Arc::new(InFlight::default())))]
    inflight: Arc<InFlight>,

    #[fieldx(private, get(clone), builder(off), default(Arc::new(Mutex::new(Vec::new()))))]
    flush_callbacks: Arc<Mutex<Vec<FlushFn>>>,
}

impl<C> Cache<C>
where
    C: Send + Sync + 'static,
{
    fn build_storages(&self) -> Arc<RwLock<HashMap<String, Arc<dyn Storage>>>> {
        let default = self
            .default_storage
            .clone()
            .unwrap_or_else(|| Arc::new(MemoryStorage::default()) as Arc<dyn Storage>);
        Arc::new(RwLock::new(HashMap::from([(DEFAULT_STORAGE.to_string(), default)])))
    }

    fn build_registry(&self) -> Arc<PolicyRegistry<C>> {
        let fallback = if !self.all() {
            None
        }
        else if self.ttl() <= 0.0 {
            warn!("{}", ConfigError::AllWithoutTtl);
            None
        }
        else {
            self.storage(DEFAULT_STORAGE).map(|storage| Fallback {
                defaults: self.policy_defaults(),
                storage,
            })
        };
        Arc::new(PolicyRegistry::new(fallback))
    }

    fn build_notifier(&self) -> Arc<Notifier> {
        Arc::new(Notifier::new(self.observer.clone(), self.report_interval.is_some()))
    }

    fn policy_defaults(&self) -> PolicyDefaults<C> {
        PolicyDefaults {
            ttl:     self.ttl(),
            stale:   self.stale(),
            storage: DEFAULT_STORAGE.to_string(),
            skip:    self.skip.clone(),
        }
    }

    /// Build a cache with its storages from declarative options. Remote storages are connected before this returns.
    pub async fn from_options(options: CacheOptions) -> Result<Self, ConfigError> {
        if options.all && options.ttl <= 0.0 {
            return Err(ConfigError::AllWithoutTtl);
        }
        options.validate()?;

        let mut builder = Self::builder()
            .ttl(options.ttl)
            .stale(options.stale)
            .all(options.all)
            .default_storage(options.storage.build_storage(DEFAULT_STORAGE).await?);
        if let Some(interval) = options.report_interval_duration() {
            builder = builder.report_interval(interval);
        }
        let cache = builder.build()?;

        for (name, storage_options) in &options.storages {
            cache.add_storage(name.clone(), storage_options.build_storage(name).await?);
        }

        Ok(cache)
    }

    /// Register a named storage, replacing any previous one with the same name. Policies defined before keep the
    /// storage they were resolved with.
    pub fn add_storage(&self, name: impl Into<String>, storage: Arc<dyn Storage>) {
        let name = name.into();
        debug!("storage '{name}': {storage:?}");
        self.storages().write().insert(name, storage);
    }

    pub fn storage(&self, name: &str) -> Option<Arc<dyn Storage>> {
        self.storages().read().get(name).cloned()
    }

    fn all_storages(&self) -> Vec<(String, Arc<dyn Storage>)> {
        self.storages()
            .read()
            .iter()
            .map(|(name, storage)| (name.clone(), Arc::clone(storage)))
            .collect()
    }

    /// Validate `config` and make it the policy of `identity`.
    pub fn define_policy(&self, identity: FieldIdentity, config: PolicyConfig<C>) -> Result<FieldHandle, ConfigError> {
        let policy = config.resolve(identity, &self.policy_defaults(), &self.storages().read())?;
        debug!("{policy:?}");
        let handle = FieldHandle::new(policy.identity().clone());
        self.registry().insert(policy);
        Ok(handle)
    }

    /// Handle of a field without an explicit policy. Useful when every field is cached.
    pub fn handle(&self, type_name: &str, field_name: &str) -> FieldHandle {
        FieldHandle::new(FieldIdentity::new(type_name, field_name))
    }

    /// Replace the whole field set, then refresh the storages. Calls in progress finish with the policies they started
    /// with. Nothing is replaced if any of the configurations is invalid.
    #[instrument(level = "debug", skip_all)]
    pub async fn rebuild(&self, fields: Vec<(FieldIdentity, PolicyConfig<C>)>) -> Result<Vec<FieldHandle>, ConfigError> {
        let defaults = self.policy_defaults();
        let policies = {
            let storages = self.storages();
            let storages = storages.read();
            fields
                .into_iter()
                .map(|(identity, config)| config.resolve(identity, &defaults, &storages))
                .collect::<Result<Vec<_>, _>>()?
        };

        let handles = policies
            .iter()
            .map(|policy| FieldHandle::new(policy.identity().clone()))
            .collect();
        let generation = self.registry().replace(policies);
        info!("policy registry rebuilt, generation {generation}");

        if let Err(err) = self.refresh().await {
            warn!("storage refresh after rebuild failed: {err}");
        }

        Ok(handles)
    }

    /// Run a field call through the cache.
    ///
    /// `compute` is the field's own computation. It is spawned as a task once it's known the result has to be
    /// computed, so it completes and populates the cache even if the caller goes away. The returned error is always the
    /// computation's own.
    pub async fn invoke<F, Fut>(&self, handle: &FieldHandle, mut call: FieldCall<C>, compute: F) -> FieldResult
    where
        F: FnOnce(Arc<FieldCall<C>>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        call.set_identity(handle.identity().clone());
        let call = Arc::new(call);

        let Some(policy) = self.registry().resolve(handle.identity())
        else {
            return run(compute, call).await;
        };
        let notifier = self.notifier();
        let field = policy.identity();

        if call.is_mutation_like() {
            notifier.skip(field);
            let result = run(compute, Arc::clone(&call)).await;
            if let Ok(value) = &result {
                self.invalidate_after_mutation(&policy, call, value.clone()).await;
            }
            return result;
        }

        if self.should_skip(&policy, &call).await {
            notifier.skip(field);
            return run(compute, call).await;
        }

        if policy.ttl().is_zero() {
            return run(compute, call).await;
        }

        let key = match Self::derive_key(&policy, &call) {
            Ok(key) => key,
            Err(err) => {
                notifier.error(field, &CacheError::Key(err));
                return run(compute, call).await;
            }
        };

        let inflight = self.inflight();
        if let Some(waiter) = inflight.join(&key) {
            notifier.dedupe(field);
            return waiter.wait().await;
        }

        match policy.storage().get(&key).await {
            Ok(Some(entry)) => match entry.freshness() {
                Freshness::Fresh => {
                    notifier.hit(field);
                    return Ok(entry.into_value());
                }
                Freshness::Stale => {
                    notifier.hit(field);
                    if let Slot::Leader(guard) = inflight.acquire(&key) {
                        trace!("refreshing stale '{key}'");
                        tokio::spawn(Self::compute_and_store(
                            Arc::clone(&policy),
                            call,
                            compute,
                            guard,
                            Arc::clone(&notifier),
                            true,
                        ));
                    }
                    return Ok(entry.into_value());
                }
                Freshness::Expired => (),
            },
            Ok(None) => (),
            // A storage that can't be read is a miss; the computed result is still offered to it.
            Err(err) => notifier.error(field, &err.into()),
        }

        match inflight.acquire(&key) {
            Slot::Waiter(waiter) => {
                notifier.dedupe(field);
                waiter.wait().await
            }
            Slot::Leader(guard) => {
                notifier.miss(field);
                let waiter = guard.waiter();
                tokio::spawn(Self::compute_and_store(
                    Arc::clone(&policy),
                    call,
                    compute,
                    guard,
                    Arc::clone(&notifier),
                    false,
                ));
                waiter.wait().await
            }
        }
    }

    fn derive_key(policy: &Policy<C>, call: &FieldCall<C>) -> anyhow::Result<String> {
        let derived = match policy.key_mode() {
            KeyMode::Custom(key_fn) => key_fn(call)?,
            KeyMode::Default { extend } => {
                let extension = match extend {
                    Some(extend) => extend(call)?,
                    None => None,
                };
                key::default_key(call.args(), call.requested_fields(), extension.as_deref())
            }
        };
        Ok(key::compose(policy.identity(), &derived))
    }

    async fn should_skip(&self, policy: &Policy<C>, call: &Arc<FieldCall<C>>) -> bool {
        if call.is_skip_requested() {
            return true;
        }
        let Some(skip) = policy.skip_fn()
        else {
            return false;
        };
        match skip(Arc::clone(call)).await {
            Ok(skip) => skip,
            Err(err) => {
                self.notifier().error(policy.identity(), &CacheError::Skip(err));
                false
            }
        }
    }

    // The leader's side of a flight. The result is written to the storage before the waiters are released.
    async fn compute_and_store<F, Fut>(
        policy: Arc<Policy<C>>,
        call: Arc<FieldCall<C>>,
        compute: F,
        guard: FlightGuard,
        notifier: Arc<Notifier>,
        refresh: bool,
    ) where
        F: FnOnce(Arc<FieldCall<C>>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let result = run(compute, Arc::clone(&call)).await;
        match &result {
            Ok(value) => Self::store(&policy, call, guard.key(), value, &notifier).await,
            // The stale entry stays as it is and expires on its own.
            Err(err) if refresh => notifier.error(
                policy.identity(),
                &CacheError::Refresh {
                    key:   guard.key().to_string(),
                    cause: Arc::clone(err),
                },
            ),
            Err(_) => (),
        }
        guard.settle(result);
    }

    async fn store(policy: &Policy<C>, call: Arc<FieldCall<C>>, key: &str, value: &Value, notifier: &Notifier) {
        let ttl = policy.ttl().for_value(value);
        if ttl.is_zero() {
            trace!("'{key}': zero ttl for this result, not storing");
            return;
        }

        let storage = policy.storage();
        let references = match policy.references_fn() {
            Some(references_fn) if storage.tracks_references() => match references_fn(call, value.clone()).await {
                Ok(references) => references,
                Err(err) => {
                    // An entry without its references could not be invalidated.
                    notifier.error(policy.identity(), &CacheError::References(err));
                    return;
                }
            },
            _ => Vec::new(),
        };

        let entry = CacheEntry::new(value.clone(), ttl, policy.stale());
        if let Err(err) = storage.set(key, entry, &references).await {
            notifier.error(policy.identity(), &err.into());
        }
    }

    async fn invalidate_after_mutation(&self, policy: &Policy<C>, call: Arc<FieldCall<C>>, value: Value) {
        let Some(invalidate_fn) = policy.invalidate_fn()
        else {
            return;
        };
        let notifier = self.notifier();

        let references = match invalidate_fn(call, value).await {
            Ok(references) if references.is_empty() => return,
            Ok(references) => references,
            Err(err) => {
                notifier.error(policy.identity(), &CacheError::Invalidate(err));
                return;
            }
        };

        let storage = policy.storage();
        if !storage.tracks_references() {
            warn!(
                "{}: storage '{}' doesn't track references, nothing to invalidate",
                policy.identity(),
                policy.storage_name()
            );
            return;
        }

        match storage.invalidate(&references.into_references()).await {
            Ok(removed) => debug!("{}: invalidated {removed} entries", policy.identity()),
            Err(err) => notifier.error(policy.identity(), &err.into()),
        }
    }

    /// Remove every entry indexed under `references` in the named storage, or in the default one. Returns the number
    /// of entries removed.
    #[instrument(level = "debug", skip(self, references))]
    pub async fn invalidate<R>(&self, references: R, storage: Option<&str>) -> Result<usize, CacheError>
    where
        R: IntoReferences,
    {
        let name = storage.unwrap_or(DEFAULT_STORAGE);
        let Some(storage) = self.storage(name)
        else {
            warn!("invalidation requested for unknown storage '{name}'");
            return Err(CacheError::UnknownStorage(name.to_string()));
        };

        if !storage.tracks_references() {
            warn!("storage '{name}' doesn't track references, nothing to invalidate");
            return Ok(0);
        }

        Ok(storage.invalidate(&references.into_references()).await?)
    }

    /// Drop all entries of all storages.
    #[instrument(level = "debug", skip(self))]
    pub async fn clear(&self) -> Result<(), CacheError> {
        for (name, storage) in self.all_storages() {
            debug!("clearing storage '{name}'");
            storage.clear().await?;
        }
        Ok(())
    }

    /// Reset all storages. Used when the field set the cache serves has changed.
    #[instrument(level = "debug", skip(self))]
    pub async fn refresh(&self) -> Result<(), CacheError> {
        for (name, storage) in self.all_storages() {
            debug!("refreshing storage '{name}'");
            storage.refresh().await?;
        }
        Ok(())
    }

    /// Prune the reference index of the named storage, or of the default one.
    #[instrument(level = "debug", skip(self))]
    pub async fn gc(&self, storage: Option<&str>, mode: GcMode) -> Result<GcReport, CacheError> {
        let name = storage.unwrap_or(DEFAULT_STORAGE);
        let storage = self
            .storage(name)
            .ok_or_else(|| CacheError::UnknownStorage(name.to_string()))?;
        Ok(storage.gc(mode).await?)
    }

    /// Add a receiver of the counters snapshots.
    pub fn on_flush<F>(&self, callback: F)
    where
        F: Fn(&Report) + Send + Sync + 'static,
    {
        self.flush_callbacks.lock().push(Arc::new(callback));
    }

    /// Take the counters accumulated since the previous flush and hand them to the `on_flush` callbacks.
    pub fn flush_report(&self) -> Report {
        let report = self.notifier().reporter().flush_and_clear();
        deliver(&self.flush_callbacks, &report);
        report
    }

    /// Start the periodic report flush. `None` if no report interval is configured. The task ends once the cache is
    /// dropped.
    pub fn spawn_reporter(&self) -> Option<JoinHandle<()>> {
        let interval = self.report_interval?;
        let notifier = Arc::downgrade(&self.notifier());
        let callbacks = Arc::downgrade(&self.flush_callbacks());

        debug!("starting reporter, interval {interval:?}");
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let (Some(notifier), Some(callbacks)) = (notifier.upgrade(), callbacks.upgrade())
                else {
                    debug!("cache is gone, reporter stops");
                    break;
                };
                let report = notifier.reporter().flush_and_clear();
                trace!("report of {} fields", report.len());
                deliver(&callbacks, &report);
            }
        }))
    }

    /// Number of flights in progress.
    pub fn in_flight(&self) -> usize {
        self.inflight().len()
    }
}
