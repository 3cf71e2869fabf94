use std::fmt::Debug;

use async_trait::async_trait;

use crate::entry::CacheEntry;
use crate::error::CacheError;
use crate::error::StorageError;
use crate::invalidation::GcMode;
use crate::invalidation::GcReport;
use crate::invalidation::ReferencePattern;
use crate::types::FieldIdentity;

/// Uniform contract of a cache storage backend.
///
/// Every storage owns its entries and its own reference index; nothing is shared between two storage instances.
/// Freshness classification is the caller's job: `get` only reports what is stored, timestamps included.
#[async_trait]
pub trait Storage: Debug + Send + Sync + 'static {
    /// Backend name for diagnostics, e.g. `"memory"`.
    fn kind(&self) -> &'static str;

    /// If false then references passed to [`set`](Self::set) are ignored and invalidation is not possible.
    fn tracks_references(&self) -> bool;

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StorageError>;

    /// Insert or overwrite `key`, then index it under every reference. Indexing is idempotent.
    async fn set(&self, key: &str, entry: CacheEntry, references: &[String]) -> Result<(), StorageError>;

    async fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// Remove every entry indexed under the matching references. Returns the number of keys deleted; keys that are
    /// already gone are not counted and are not an error.
    async fn invalidate(&self, references: &[ReferencePattern]) -> Result<usize, StorageError>;

    /// Drop all entries and the reference index.
    async fn clear(&self) -> Result<(), StorageError>;

    /// Used when the field set is rebuilt after an upstream schema change.
    async fn refresh(&self) -> Result<(), StorageError> {
        self.clear().await
    }

    /// Prune reference index members whose entries no longer exist.
    async fn gc(&self, mode: GcMode) -> Result<GcReport, StorageError>;
}

/// Best-effort notifications about call outcomes.
///
/// The methods are invoked synchronously on the calling task and must return quickly. A panic inside any of them is
/// caught and discarded; it never changes the outcome of the call.
pub trait Observer: Send + Sync + 'static {
    fn on_hit(&self, _field: &FieldIdentity) {}
    fn on_miss(&self, _field: &FieldIdentity) {}
    fn on_skip(&self, _field: &FieldIdentity) {}
    fn on_dedupe(&self, _field: &FieldIdentity) {}
    fn on_error(&self, _field: &FieldIdentity, _error: &CacheError) {}
}
