use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt::Debug;
use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use fieldx::fxstruct;
use moka::future::Cache;
use moka::policy::EvictionPolicy;
use moka::Expiry;
use parking_lot::Mutex;
use tracing::debug;
use tracing::instrument;

use crate::entry::CacheEntry;
use crate::entry::Freshness;
use crate::error::StorageError;
use crate::invalidation::GcMode;
use crate::invalidation::GcReport;
use crate::invalidation::ReferencePattern;
use crate::traits::Storage;

pub const DEFAULT_MEMORY_SIZE: u64 = 1024;

// Entries live until the end of their stale window; classification into fresh and stale is done by the reader.
struct EntryExpiry;

impl Expiry<String, CacheEntry> for EntryExpiry {
    fn expire_after_create(&self, _key: &String, value: &CacheEntry, _created_at: Instant) -> Option<Duration> {
        Some(value.remaining_lifetime())
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CacheEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.remaining_lifetime())
    }
}

/// Bounded in-process storage with least-recently-used eviction.
///
/// ```ignore
/// let storage = MemoryStorage::builder()
///     .size(10_000)
///     .invalidation(true)
///     .build()?;
/// ```
#[fxstruct(
    no_new,
    default,
    sync,
    builder(
        doc("Builder object of [`MemoryStorage`].", "", "See [`MemoryStorage::builder()`] method."),
        method_doc("Implement builder pattern for [`MemoryStorage`]."),
    )
)]
pub struct MemoryStorage {
    /// Maximum number of entries.
    #[fieldx(get(copy), default(DEFAULT_MEMORY_SIZE))]
    size: u64,

    /// Track references of stored entries. Without it nothing can be invalidated by reference.
    #[fieldx(get(copy), default(false))]
    invalidation: bool,

    #[fieldx(lazy, private, get(clone), builder(off))]
    entries: Cache<String, CacheEntry>,

    // Reference to the keys tagged with it. Allowed to hold keys that were evicted already.
    #[fieldx(private, builder(off), default(Mutex::new(HashMap::new())))]
    references: Mutex<HashMap<String, HashSet<String>>>,
}

impl MemoryStorage {
    fn build_entries(&self) -> Cache<String, CacheEntry> {
        Cache::builder()
            .max_capacity(self.size())
            .name("field-cache")
            .eviction_policy(EvictionPolicy::lru())
            .expire_after(EntryExpiry)
            .build()
    }

    // Detach the key sets of all matching references. Their keys are about to be removed so the sets aren't needed
    // anymore.
    fn take_keys(&self, patterns: &[ReferencePattern]) -> HashSet<String> {
        let mut references = self.references.lock();
        let mut keys = HashSet::new();
        for pattern in patterns {
            match pattern {
                ReferencePattern::Exact(reference) => {
                    if let Some(set) = references.remove(reference) {
                        keys.extend(set);
                    }
                }
                ReferencePattern::Prefix(_) => {
                    let matching = references
                        .keys()
                        .filter(|r| pattern.matches(r))
                        .cloned()
                        .collect::<Vec<_>>();
                    for reference in matching {
                        if let Some(set) = references.remove(&reference) {
                            keys.extend(set);
                        }
                    }
                }
            }
        }
        keys
    }

    #[cfg(test)]
    pub(crate) fn indexed_keys(&self, reference: &str) -> Vec<String> {
        let mut keys = self
            .references
            .lock()
            .get(reference)
            .map(|set| set.iter().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        keys.sort();
        keys
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    fn kind(&self) -> &'static str {
        "memory"
    }

    fn tracks_references(&self) -> bool {
        self.invalidation()
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StorageError> {
        Ok(self
            .entries()
            .get(key)
            .await
            .filter(|entry| entry.freshness() != Freshness::Expired))
    }

    async fn set(&self, key: &str, entry: CacheEntry, references: &[String]) -> Result<(), StorageError> {
        self.entries().insert(key.to_string(), entry).await;

        if self.invalidation() && !references.is_empty() {
            let mut index = self.references.lock();
            for reference in references {
                index.entry(reference.clone()).or_default().insert(key.to_string());
            }
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries().remove(key).await;
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    async fn invalidate(&self, references: &[ReferencePattern]) -> Result<usize, StorageError> {
        let keys = self.take_keys(references);
        let entries = self.entries();
        let mut removed = 0;
        for key in keys {
            if entries.remove(&key).await.is_some() {
                removed += 1;
            }
        }
        debug!("removed {removed} entries");
        Ok(removed)
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.entries().invalidate_all();
        self.references.lock().clear();
        Ok(())
    }

    // Everything is local so a lazy run does the same full pass as a strict one.
    #[instrument(level = "debug", skip(self))]
    async fn gc(&self, _mode: GcMode) -> Result<GcReport, StorageError> {
        let entries = self.entries();
        let mut report = GcReport {
            loops: 1,
            ..Default::default()
        };

        self.references.lock().retain(|_, keys| {
            report.references_scanned += 1;
            report.keys_scanned += keys.len();
            let before = keys.len();
            keys.retain(|key| entries.contains_key(key));
            report.keys_removed += before - keys.len();
            if keys.is_empty() {
                report.references_removed += 1;
                false
            }
            else {
                true
            }
        });

        Ok(report)
    }
}

impl Debug for MemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStorage")
            .field("size", &self.size())
            .field("invalidation", &self.invalidation())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn storage(invalidation: bool) -> MemoryStorage {
        MemoryStorage::builder().size(100).invalidation(invalidation).build().unwrap()
    }

    fn entry(value: serde_json::Value) -> CacheEntry {
        CacheEntry::new(value, Duration::from_secs(60), Duration::ZERO)
    }

    fn refs(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let storage = storage(false);
        let value = json!({"user": {"id": 1, "tags": [], "meta": {}}, "list": [[], {}]});
        storage.set("k", entry(value.clone()), &[]).await.unwrap();
        let got = storage.get("k").await.unwrap().unwrap();
        assert_eq!(got.value(), &value);
        assert!(storage.get("other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_entry_is_absent() {
        let storage = storage(false);
        let expired = CacheEntry::created_at(0, json!(1), Duration::from_secs(1), Duration::ZERO);
        storage.set("k", expired, &[]).await.unwrap();
        assert!(storage.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reference_indexing_is_idempotent() {
        let storage = storage(true);
        storage.set("k1", entry(json!(1)), &refs(&["r"])).await.unwrap();
        storage.set("k1", entry(json!(2)), &refs(&["r"])).await.unwrap();
        storage.set("k2", entry(json!(3)), &refs(&["r", "s"])).await.unwrap();
        assert_eq!(storage.indexed_keys("r"), vec!["k1", "k2"]);
        assert_eq!(storage.indexed_keys("s"), vec!["k2"]);
    }

    #[tokio::test]
    async fn test_invalidate_exact() {
        let storage = storage(true);
        storage.set("k1", entry(json!(1)), &refs(&["r1"])).await.unwrap();
        storage.set("k2", entry(json!(2)), &refs(&["r2"])).await.unwrap();

        let removed = storage.invalidate(&[ReferencePattern::parse("r1")]).await.unwrap();
        assert_eq!(removed, 1);
        assert!(storage.get("k1").await.unwrap().is_none());
        assert!(storage.get("k2").await.unwrap().is_some());

        // Repeating is a no-op.
        assert_eq!(storage.invalidate(&[ReferencePattern::parse("r1")]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_invalidate_wildcard() {
        let storage = storage(true);
        for id in 1..=3 {
            storage
                .set(&format!("u{id}"), entry(json!(id)), &[format!("user:{id}")])
                .await
                .unwrap();
        }
        storage.set("p1", entry(json!("p")), &refs(&["post:1"])).await.unwrap();

        let removed = storage.invalidate(&[ReferencePattern::parse("user:*")]).await.unwrap();
        assert_eq!(removed, 3);
        assert!(storage.get("p1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_untracked_references_are_ignored() {
        let storage = storage(false);
        storage.set("k1", entry(json!(1)), &refs(&["r1"])).await.unwrap();
        assert!(storage.indexed_keys("r1").is_empty());
        assert_eq!(storage.invalidate(&[ReferencePattern::parse("r1")]).await.unwrap(), 0);
        assert!(storage.get("k1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_clear() {
        let storage = storage(true);
        storage.set("k1", entry(json!(1)), &refs(&["r1"])).await.unwrap();
        storage.clear().await.unwrap();
        assert!(storage.get("k1").await.unwrap().is_none());
        assert!(storage.indexed_keys("r1").is_empty());
    }

    #[tokio::test]
    async fn test_gc_prunes_gone_keys() {
        let storage = storage(true);
        storage.set("k1", entry(json!(1)), &refs(&["r1", "shared"])).await.unwrap();
        storage.set("k2", entry(json!(2)), &refs(&["shared"])).await.unwrap();
        storage.remove("k1").await.unwrap();
        storage.entries().run_pending_tasks().await;

        let report = storage.gc(GcMode::strict()).await.unwrap();
        assert_eq!(report.references_scanned, 2);
        assert_eq!(report.references_removed, 1);
        assert_eq!(report.keys_removed, 2);
        assert!(storage.indexed_keys("r1").is_empty());
        assert_eq!(storage.indexed_keys("shared"), vec!["k2"]);
    }

    #[tokio::test]
    async fn test_bounded_size() {
        let storage = MemoryStorage::builder().size(2).build().unwrap();
        for id in 0..10 {
            storage.set(&format!("k{id}"), entry(json!(id)), &[]).await.unwrap();
        }
        let entries = storage.entries();
        entries.run_pending_tasks().await;
        assert!(entries.entry_count() <= 2);
    }
}
