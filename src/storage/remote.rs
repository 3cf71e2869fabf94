use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fieldx::fxstruct;
use tracing::debug;
use tracing::instrument;
use tracing::trace;

use crate::entry::CacheEntry;
use crate::entry::Freshness;
use crate::error::StorageError;
use crate::invalidation::GcMode;
use crate::invalidation::GcReport;
use crate::invalidation::ReferencePattern;
use crate::traits::Storage;

/// Minimal command set of a networked key/value store with native expiry and set values.
///
/// Keys and set names share one namespace. `scan` follows the cursor semantics of Redis `SCAN`: a pass starts at
/// cursor 0 and is complete when 0 is returned again; `pattern` is a glob.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), StorageError>;
    /// Returns the number of keys that actually existed.
    async fn delete(&self, keys: &[String]) -> Result<usize, StorageError>;
    async fn exists(&self, keys: &[String]) -> Result<Vec<bool>, StorageError>;
    async fn set_add(&self, set: &str, members: &[String]) -> Result<(), StorageError>;
    async fn set_members(&self, set: &str) -> Result<Vec<String>, StorageError>;
    async fn set_remove(&self, set: &str, members: &[String]) -> Result<(), StorageError>;
    async fn is_set(&self, key: &str) -> Result<bool, StorageError>;
    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<(u64, Vec<String>), StorageError>;
    /// Drop everything in the current database.
    async fn flush(&self) -> Result<(), StorageError>;
}

/// Escape glob metacharacters so that `s` matches literally in a `SCAN MATCH` pattern.
pub(crate) fn glob_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Storage on top of a [`KvStore`]. Entries are JSON documents expiring natively at the end of their stale window;
/// every reference is a set of the keys tagged with it.
#[fxstruct(
    no_new,
    default(off),
    sync,
    builder(
        doc("Builder object of [`RemoteStorage`].", "", "See [`RemoteStorage::builder()`] method."),
        method_doc("Implement builder pattern for [`RemoteStorage`]."),
    )
)]
pub struct RemoteStorage<K>
where
    K: KvStore,
{
    #[fieldx(builder(required, into), get(clone))]
    kv: Arc<K>,

    /// Maintain reference sets.
    #[fieldx(get(copy), default(false))]
    invalidation: bool,

    /// Prepended to a reference to form the name of its set.
    #[fieldx(get, builder(into), default(String::new()))]
    reference_prefix: String,

    // Where the next lazy GC run resumes.
    #[fieldx(lock, private, get(copy), set, builder(off), default(0))]
    gc_cursor: u64,
}

impl<K> RemoteStorage<K>
where
    K: KvStore,
{
    fn set_name(&self, reference: &str) -> String {
        format!("{}{}", self.reference_prefix(), reference)
    }

    fn scan_pattern(&self, prefix: &str) -> String {
        format!("{}*", glob_escape(&self.set_name(prefix)))
    }

    async fn matching_sets(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let kv = self.kv();
        let pattern = self.scan_pattern(prefix);
        let mut sets = Vec::new();
        let mut cursor = 0;
        loop {
            let (next, keys) = kv.scan(cursor, &pattern, 256).await?;
            for key in keys {
                if kv.is_set(&key).await? {
                    sets.push(key);
                }
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(sets)
    }

    // Scan one chunk of keys starting at `cursor` and prune the reference sets found in it.
    async fn gc_step(&self, cursor: u64, chunk: usize, report: &mut GcReport) -> Result<u64, StorageError> {
        let kv = self.kv();
        let (next, keys) = kv.scan(cursor, &self.scan_pattern(""), chunk).await?;
        report.loops += 1;

        for set in keys {
            if !kv.is_set(&set).await? {
                continue;
            }
            report.references_scanned += 1;

            let members = kv.set_members(&set).await?;
            let mut gone = Vec::new();
            for batch in members.chunks(chunk) {
                let exists = kv.exists(batch).await?;
                report.keys_scanned += batch.len();
                gone.extend(
                    batch
                        .iter()
                        .zip(exists)
                        .filter(|(_, exists)| !exists)
                        .map(|(key, _)| key.clone()),
                );
            }

            if gone.is_empty() {
                continue;
            }

            report.keys_removed += gone.len();
            if gone.len() == members.len() {
                trace!("dropping reference set '{set}'");
                kv.delete(&[set]).await?;
                report.references_removed += 1;
            }
            else {
                kv.set_remove(&set, &gone).await?;
            }
        }

        Ok(next)
    }
}

#[async_trait]
impl<K> Storage for RemoteStorage<K>
where
    K: KvStore,
{
    fn kind(&self) -> &'static str {
        "remote"
    }

    fn tracks_references(&self) -> bool {
        self.invalidation()
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StorageError> {
        let Some(raw) = self.kv().get(key).await?
        else {
            return Ok(None);
        };
        let entry: CacheEntry = serde_json::from_str(&raw)?;
        Ok((entry.freshness() != Freshness::Expired).then_some(entry))
    }

    async fn set(&self, key: &str, entry: CacheEntry, references: &[String]) -> Result<(), StorageError> {
        let lifetime = entry.remaining_lifetime();
        if lifetime.is_zero() {
            return Ok(());
        }

        let kv = self.kv();
        // The document is written only once it is reachable from all of its references. A member left behind by a
        // failed write is pruned by GC.
        if self.invalidation() {
            let member = [key.to_string()];
            for reference in references {
                kv.set_add(&self.set_name(reference), &member).await?;
            }
        }

        kv.set(key, serde_json::to_string(&entry)?, lifetime).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.kv().delete(&[key.to_string()]).await?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    async fn invalidate(&self, references: &[ReferencePattern]) -> Result<usize, StorageError> {
        let mut sets = Vec::new();
        for pattern in references {
            match pattern {
                ReferencePattern::Exact(reference) => sets.push(self.set_name(reference)),
                ReferencePattern::Prefix(prefix) => sets.extend(self.matching_sets(prefix).await?),
            }
        }

        let kv = self.kv();
        let mut keys = HashSet::new();
        for set in &sets {
            keys.extend(kv.set_members(set).await?);
        }

        let keys = keys.into_iter().collect::<Vec<_>>();
        let removed = if keys.is_empty() { 0 } else { kv.delete(&keys).await? };
        if !sets.is_empty() {
            kv.delete(&sets).await?;
        }

        debug!("removed {removed} entries from {} reference sets", sets.len());
        Ok(removed)
    }

    #[instrument(level = "debug", skip(self))]
    async fn clear(&self) -> Result<(), StorageError> {
        self.kv().flush().await?;
        self.set_gc_cursor(0);
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    async fn gc(&self, mode: GcMode) -> Result<GcReport, StorageError> {
        let chunk = mode.chunk();
        let mut report = GcReport::default();

        match mode {
            GcMode::Strict { .. } => {
                let mut cursor = 0;
                loop {
                    cursor = self.gc_step(cursor, chunk, &mut report).await?;
                    if cursor == 0 {
                        break;
                    }
                }
            }
            GcMode::Lazy { cursor, .. } => {
                let start = cursor.unwrap_or_else(|| self.gc_cursor());
                let next = self.gc_step(start, chunk, &mut report).await?;
                self.set_gc_cursor(next);
                report.cursor = next;
            }
        }

        debug!("{report:?}");
        Ok(report)
    }
}

impl<K> Debug for RemoteStorage<K>
where
    K: KvStore,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStorage")
            .field("invalidation", &self.invalidation())
            .field("reference_prefix", self.reference_prefix())
            .finish()
    }
}
