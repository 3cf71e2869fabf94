#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use field_cache::prelude::*;
use parking_lot::Mutex;
use serde_json::json;
use serde_json::Value;

pub type Compute = Box<dyn FnOnce(Arc<FieldCall<()>>) -> BoxFuture<'static, anyhow::Result<Value>> + Send>;

pub fn call() -> FieldCall<()> {
    FieldCall::new(Arc::new(()))
}

pub fn memory(invalidation: bool) -> Arc<MemoryStorage> {
    Arc::new(
        MemoryStorage::builder()
            .size(1000)
            .invalidation(invalidation)
            .build()
            .unwrap(),
    )
}

/// A cache with counters enabled. The interval is long enough for the reporter to never fire on its own.
pub fn cache_with(storage: Arc<dyn Storage>) -> Cache<()> {
    Cache::builder()
        .default_storage(storage)
        .report_interval(Duration::from_secs(3600))
        .build()
        .unwrap()
}

/// A computation producing `{"n": <number of the execution>}`.
pub fn numbered(counter: &Arc<AtomicUsize>, delay: Duration) -> Compute {
    let counter = Arc::clone(counter);
    Box::new(move |_call: Arc<FieldCall<()>>| -> BoxFuture<'static, anyhow::Result<Value>> {
        Box::pin(async move {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Ok(json!({ "n": n }))
        })
    })
}

/// A computation returning `value` and counting its executions.
pub fn returning(counter: &Arc<AtomicUsize>, value: Value) -> Compute {
    let counter = Arc::clone(counter);
    Box::new(move |_call: Arc<FieldCall<()>>| -> BoxFuture<'static, anyhow::Result<Value>> {
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(value)
        })
    })
}

pub fn failing(counter: &Arc<AtomicUsize>, message: &'static str) -> Compute {
    let counter = Arc::clone(counter);
    Box::new(move |_call: Arc<FieldCall<()>>| -> BoxFuture<'static, anyhow::Result<Value>> {
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Err(anyhow::anyhow!(message))
        })
    })
}

pub fn counters(report: &Report, type_name: &str, field_name: &str) -> ReportCounters {
    report
        .get(&FieldIdentity::new(type_name, field_name))
        .copied()
        .unwrap_or_default()
}

/// Wait for background refreshes to settle.
pub async fn settle(cache: &Cache<()>) {
    for _ in 0..200 {
        if cache.in_flight() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("flights didn't settle");
}

#[derive(Default)]
pub struct RecordingObserver {
    pub hits:    AtomicUsize,
    pub misses:  AtomicUsize,
    pub skips:   AtomicUsize,
    pub dedupes: AtomicUsize,
    pub errors:  Mutex<Vec<String>>,
}

impl Observer for RecordingObserver {
    fn on_hit(&self, _field: &FieldIdentity) {
        self.hits.fetch_add(1, Ordering::SeqCst);
    }

    fn on_miss(&self, _field: &FieldIdentity) {
        self.misses.fetch_add(1, Ordering::SeqCst);
    }

    fn on_skip(&self, _field: &FieldIdentity) {
        self.skips.fetch_add(1, Ordering::SeqCst);
    }

    fn on_dedupe(&self, _field: &FieldIdentity) {
        self.dedupes.fetch_add(1, Ordering::SeqCst);
    }

    fn on_error(&self, field: &FieldIdentity, error: &CacheError) {
        self.errors.lock().push(format!("{field}: {error}"));
    }
}

/// Storage wrapper counting every access to the wrapped one.
#[derive(Debug)]
pub struct CountingStorage {
    inner:      MemoryStorage,
    pub reads:  AtomicUsize,
    pub writes: AtomicUsize,
}

impl CountingStorage {
    pub fn new() -> Self {
        Self {
            inner:  MemoryStorage::builder().invalidation(true).build().unwrap(),
            reads:  AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn accesses(&self) -> usize {
        self.reads.load(Ordering::SeqCst) + self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Storage for CountingStorage {
    fn kind(&self) -> &'static str {
        "counting"
    }

    fn tracks_references(&self) -> bool {
        self.inner.tracks_references()
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StorageError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, entry: CacheEntry, references: &[String]) -> Result<(), StorageError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.set(key, entry, references).await
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.remove(key).await
    }

    async fn invalidate(&self, references: &[ReferencePattern]) -> Result<usize, StorageError> {
        self.inner.invalidate(references).await
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.inner.clear().await
    }

    async fn gc(&self, mode: GcMode) -> Result<GcReport, StorageError> {
        self.inner.gc(mode).await
    }
}

#[derive(Default)]
struct KvState {
    strings: BTreeMap<String, (String, Instant)>,
    sets:    BTreeMap<String, BTreeSet<String>>,
}

impl KvState {
    fn purge_expired(&mut self) {
        let now = Instant::now();
        self.strings.retain(|_, (_, deadline)| *deadline > now);
    }
}

/// In-memory [`KvStore`] double with Redis-like semantics.
#[derive(Default)]
pub struct MockKv {
    state:          Mutex<KvState>,
    pub fail_reads: AtomicBool,
    /// Makes every set command fail.
    pub fail_sets:  AtomicBool,
}

impl MockKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_raw(&self, key: &str, value: &str) {
        self.state.lock().strings.insert(
            key.to_string(),
            (value.to_string(), Instant::now() + Duration::from_secs(60)),
        );
    }

    pub fn has_key(&self, key: &str) -> bool {
        let mut state = self.state.lock();
        state.purge_expired();
        state.strings.contains_key(key) || state.sets.contains_key(key)
    }

    pub fn members(&self, set: &str) -> Vec<String> {
        self.state
            .lock()
            .sets
            .get(set)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn add_member(&self, set: &str, member: &str) {
        self.state
            .lock()
            .sets
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string());
    }

    fn check_sets(&self) -> Result<(), StorageError> {
        if self.fail_sets.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("READONLY You can't write against a read only replica.".into()));
        }
        Ok(())
    }

    // Only the `<literal prefix>*` shape is ever produced by the storage.
    fn matches(pattern: &str, key: &str) -> bool {
        let mut prefix = String::new();
        let mut chars = pattern.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '\\' => {
                    if let Some(escaped) = chars.next() {
                        prefix.push(escaped);
                    }
                }
                '*' if chars.peek().is_none() => return key.starts_with(&prefix),
                c => prefix.push(c),
            }
        }
        key == prefix
    }
}

#[async_trait]
impl KvStore for MockKv {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("connection refused".into()));
        }
        let mut state = self.state.lock();
        state.purge_expired();
        Ok(state.strings.get(key).map(|(value, _)| value.clone()))
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), StorageError> {
        self.state
            .lock()
            .strings
            .insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<usize, StorageError> {
        let mut state = self.state.lock();
        state.purge_expired();
        let mut deleted = 0;
        for key in keys {
            if state.strings.remove(key).is_some() || state.sets.remove(key).is_some() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn exists(&self, keys: &[String]) -> Result<Vec<bool>, StorageError> {
        let mut state = self.state.lock();
        state.purge_expired();
        Ok(keys
            .iter()
            .map(|key| state.strings.contains_key(key) || state.sets.contains_key(key))
            .collect())
    }

    async fn set_add(&self, set: &str, members: &[String]) -> Result<(), StorageError> {
        self.check_sets()?;
        self.state
            .lock()
            .sets
            .entry(set.to_string())
            .or_default()
            .extend(members.iter().cloned());
        Ok(())
    }

    async fn set_members(&self, set: &str) -> Result<Vec<String>, StorageError> {
        self.check_sets()?;
        Ok(self.members(set))
    }

    async fn set_remove(&self, set: &str, members: &[String]) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        if let Some(existing) = state.sets.get_mut(set) {
            for member in members {
                existing.remove(member);
            }
            if existing.is_empty() {
                state.sets.remove(set);
            }
        }
        Ok(())
    }

    async fn is_set(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.state.lock().sets.contains_key(key))
    }

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<(u64, Vec<String>), StorageError> {
        let mut state = self.state.lock();
        state.purge_expired();
        let keys = state
            .strings
            .keys()
            .chain(state.sets.keys())
            .filter(|key| Self::matches(pattern, key))
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect::<Vec<_>>();

        let start = (cursor as usize).min(keys.len());
        let end = (start + count.max(1)).min(keys.len());
        let next = if end >= keys.len() { 0 } else { end as u64 };
        Ok((next, keys[start..end].to_vec()))
    }

    async fn flush(&self) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        state.strings.clear();
        state.sets.clear();
        Ok(())
    }
}

pub fn remote(kv: &Arc<MockKv>, invalidation: bool) -> Arc<RemoteStorage<MockKv>> {
    Arc::new(
        RemoteStorage::<MockKv>::builder()
            .kv(Arc::clone(kv))
            .invalidation(invalidation)
            .build()
            .unwrap(),
    )
}
