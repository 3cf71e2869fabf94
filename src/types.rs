use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// `(TypeName, FieldName)` pair. Unique key into the policy registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FieldIdentity {
    type_name:  String,
    field_name: String,
}

impl FieldIdentity {
    pub fn new(type_name: impl Into<String>, field_name: impl Into<String>) -> Self {
        Self {
            type_name:  type_name.into(),
            field_name: field_name.into(),
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn field_name(&self) -> &str {
        &self.field_name
    }
}

impl Display for FieldIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.type_name, self.field_name)
    }
}

/// What happened to a call from the cache's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Hit,
    Miss,
    Skip,
    Dedupe,
    Error,
}

/// A single field call as seen by the interception layer.
///
/// `ctx` is whatever the host passes along with a request; policy functions receive it by reference and may use it to
/// partition keys or decide on skipping.
pub struct FieldCall<C> {
    identity:         FieldIdentity,
    parent:           Value,
    args:             Value,
    ctx:              Arc<C>,
    requested_fields: Vec<String>,
    mutation_like:    bool,
    skip_cache:       bool,
}

impl<C> FieldCall<C>
where
    C: Send + Sync + 'static,
{
    pub fn new(ctx: Arc<C>) -> Self {
        Self {
            identity: FieldIdentity::new("", ""),
            parent: Value::Null,
            args: Value::Object(Default::default()),
            ctx,
            requested_fields: Vec::new(),
            mutation_like: false,
            skip_cache: false,
        }
    }

    pub fn with_parent(mut self, parent: Value) -> Self {
        self.parent = parent;
        self
    }

    pub fn with_args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }

    pub fn with_requested_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requested_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Mark the call as a mutation or subscription. Such calls are never cached.
    pub fn mutation(mut self, mutation_like: bool) -> Self {
        self.mutation_like = mutation_like;
        self
    }

    /// Bypass the cache for this call only.
    pub fn skip_cache(mut self, skip: bool) -> Self {
        self.skip_cache = skip;
        self
    }

    pub(crate) fn set_identity(&mut self, identity: FieldIdentity) {
        self.identity = identity;
    }

    pub fn identity(&self) -> &FieldIdentity {
        &self.identity
    }

    pub fn parent(&self) -> &Value {
        &self.parent
    }

    pub fn args(&self) -> &Value {
        &self.args
    }

    pub fn ctx(&self) -> &Arc<C> {
        &self.ctx
    }

    pub fn requested_fields(&self) -> &[String] {
        &self.requested_fields
    }

    pub fn is_mutation_like(&self) -> bool {
        self.mutation_like
    }

    pub fn is_skip_requested(&self) -> bool {
        self.skip_cache
    }
}

impl<C> std::fmt::Debug for FieldCall<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldCall")
            .field("identity", &self.identity)
            .field("args", &self.args)
            .field("requested_fields", &self.requested_fields)
            .field("mutation_like", &self.mutation_like)
            .field("skip_cache", &self.skip_cache)
            .finish()
    }
}
