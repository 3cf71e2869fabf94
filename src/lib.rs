//! # field-cache
//!
//! Field-level result cache with request coalescing and reference-based invalidation.
//!
//! The crate sits between an API layer that resolves named, parameterized field calls (think GraphQL resolvers) and
//! the computations behind them. For every call it decides whether to serve a stored result, join an identical call
//! already in progress, or run the computation and store what it produced.
//!
//! # The Basics
//!
//! - A field is identified by its type and field names, see [`FieldIdentity`](types::FieldIdentity).
//! - Every cached field has a [`Policy`](policy::Policy): time to live, stale window, skip predicate, key derivation,
//!   storage, and the functions producing references.
//! - Cache keys are derived from the call arguments, the requested output fields, and an optional extension computed
//!   from the caller context. Argument order never matters.
//! - Concurrent identical calls execute the computation once. All of them get the same result or the same error.
//! - Within the stale window an expired entry is still served while a single background refresh replaces it.
//! - Results can be tagged with references like `user:42`. Invalidating a reference, or a prefix pattern like
//!   `user:*`, removes every entry tagged with it. Mutations invalidate through their policy's `invalidate` function.
//! - Two storage backends are provided: a bounded in-process LRU store and a remote key/value store. The latter is
//!   implemented for Redis behind the `redis` feature.
//! - Failures of the caching machinery never reach the caller. They are logged, counted, and handed to the
//!   [`Observer`](traits::Observer); the call falls back to direct computation.
//!
//! # Features
//!
//! - `redis`: the Redis backend.
//! - `tracing`: [`init_tracing()`] which installs an `EnvFilter`-driven subscriber.

pub mod cache;
pub mod entry;
pub mod error;
pub(crate) mod inflight;
pub mod invalidation;
pub mod key;
pub mod options;
pub mod policy;
pub(crate) mod registry;
pub mod report;
pub mod storage;
pub mod traits;
pub mod types;

#[doc(inline)]
pub use cache::Cache;
#[doc(inline)]
pub use cache::FieldHandle;
#[doc(inline)]
pub use traits::Observer;
#[doc(inline)]
pub use traits::Storage;

pub mod prelude {
    pub use crate::cache::Cache;
    pub use crate::cache::FieldHandle;
    pub use crate::entry::CacheEntry;
    pub use crate::error::CacheError;
    pub use crate::error::ConfigError;
    pub use crate::error::FieldError;
    pub use crate::error::FieldResult;
    pub use crate::error::StorageError;
    pub use crate::invalidation::GcMode;
    pub use crate::invalidation::GcReport;
    pub use crate::invalidation::ReferencePattern;
    pub use crate::options::CacheOptions;
    pub use crate::options::StorageOptions;
    pub use crate::policy::skip_fn;
    pub use crate::policy::PolicyConfig;
    pub use crate::report::Report;
    pub use crate::report::ReportCounters;
    pub use crate::storage::KvStore;
    pub use crate::storage::MemoryStorage;
    pub use crate::storage::RemoteStorage;
    pub use crate::traits::Observer;
    pub use crate::traits::Storage;
    pub use crate::types::*;
}

/// Install a global fmt subscriber filtered by `RUST_LOG`.
#[cfg(feature = "tracing")]
pub fn init_tracing() -> Result<(), tracing_subscriber::util::TryInitError> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    tracing::info!("Tracing initialized");
    Ok(())
}
