use std::collections::BTreeMap;
use std::collections::HashMap;
use std::panic::catch_unwind;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

use crate::error::CacheError;
use crate::traits::Observer;
use crate::types::FieldIdentity;
use crate::types::Outcome;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReportCounters {
    pub dedupes: u64,
    pub hits:    u64,
    pub misses:  u64,
    pub skips:   u64,
    pub errors:  u64,
}

impl ReportCounters {
    fn bump(&mut self, outcome: Outcome) {
        let counter = match outcome {
            Outcome::Hit => &mut self.hits,
            Outcome::Miss => &mut self.misses,
            Outcome::Skip => &mut self.skips,
            Outcome::Dedupe => &mut self.dedupes,
            Outcome::Error => &mut self.errors,
        };
        *counter += 1;
    }
}

/// Counters accumulated since the previous flush, ordered by field identity.
pub type Report = BTreeMap<FieldIdentity, ReportCounters>;

/// Per-field outcome counters.
///
/// A disabled aggregator never touches its map.
#[derive(Debug, Default)]
pub struct ReportAggregator {
    enabled:  bool,
    counters: Mutex<HashMap<FieldIdentity, ReportCounters>>,
}

impl ReportAggregator {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn record(&self, field: &FieldIdentity, outcome: Outcome) {
        if !self.enabled {
            return;
        }
        let mut counters = self.counters.lock();
        match counters.get_mut(field) {
            Some(c) => c.bump(outcome),
            None => counters.entry(field.clone()).or_default().bump(outcome),
        }
    }

    /// Take a snapshot and reset all counters in one step. Nothing recorded concurrently gets lost or double counted.
    pub fn flush_and_clear(&self) -> Report {
        std::mem::take(&mut *self.counters.lock()).into_iter().collect()
    }
}

/// Delivers outcomes to both the aggregator and the user observer.
pub(crate) struct Notifier {
    observer: Option<Arc<dyn Observer>>,
    reporter: ReportAggregator,
}

impl Notifier {
    pub(crate) fn new(observer: Option<Arc<dyn Observer>>, reporting: bool) -> Self {
        Self {
            observer,
            reporter: ReportAggregator::new(reporting),
        }
    }

    pub(crate) fn reporter(&self) -> &ReportAggregator {
        &self.reporter
    }

    fn observe(&self, f: impl FnOnce(&dyn Observer)) {
        if let Some(observer) = self.observer.as_deref() {
            if catch_unwind(AssertUnwindSafe(|| f(observer))).is_err() {
                warn!("observer panicked; ignoring");
            }
        }
    }

    pub(crate) fn hit(&self, field: &FieldIdentity) {
        self.reporter.record(field, Outcome::Hit);
        self.observe(|o| o.on_hit(field));
    }

    pub(crate) fn miss(&self, field: &FieldIdentity) {
        self.reporter.record(field, Outcome::Miss);
        self.observe(|o| o.on_miss(field));
    }

    pub(crate) fn skip(&self, field: &FieldIdentity) {
        self.reporter.record(field, Outcome::Skip);
        self.observe(|o| o.on_skip(field));
    }

    pub(crate) fn dedupe(&self, field: &FieldIdentity) {
        self.reporter.record(field, Outcome::Dedupe);
        self.observe(|o| o.on_dedupe(field));
    }

    pub(crate) fn error(&self, field: &FieldIdentity, error: &CacheError) {
        warn!("{field}: {error}");
        self.reporter.record(field, Outcome::Error);
        self.observe(|o| o.on_error(field, error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    fn field(name: &str) -> FieldIdentity {
        FieldIdentity::new("Query", name)
    }

    #[test]
    fn test_flush_and_clear() {
        let aggregator = ReportAggregator::new(true);
        aggregator.record(&field("a"), Outcome::Hit);
        aggregator.record(&field("a"), Outcome::Hit);
        aggregator.record(&field("a"), Outcome::Miss);
        aggregator.record(&field("b"), Outcome::Dedupe);

        let report = aggregator.flush_and_clear();
        assert_eq!(report.len(), 2);
        assert_eq!(
            report[&field("a")],
            ReportCounters {
                hits: 2,
                misses: 1,
                ..Default::default()
            }
        );
        assert_eq!(report[&field("b")].dedupes, 1);

        assert!(aggregator.flush_and_clear().is_empty());
    }

    #[test]
    fn test_disabled_is_noop() {
        let aggregator = ReportAggregator::new(false);
        aggregator.record(&field("a"), Outcome::Hit);
        assert!(aggregator.flush_and_clear().is_empty());
        assert!(aggregator.counters.lock().is_empty());
    }

    struct Panicky(AtomicUsize);

    impl Observer for Panicky {
        fn on_hit(&self, _field: &FieldIdentity) {
            self.0.fetch_add(1, Ordering::SeqCst);
            panic!("observer failure");
        }
    }

    #[test]
    fn test_observer_panic_is_contained() {
        let observer = Arc::new(Panicky(AtomicUsize::new(0)));
        let shared: Arc<dyn Observer> = observer.clone();
        let notifier = Notifier::new(Some(shared), true);
        notifier.hit(&field("a"));
        notifier.hit(&field("a"));
        assert_eq!(observer.0.load(Ordering::SeqCst), 2);
        assert_eq!(notifier.reporter().flush_and_clear()[&field("a")].hits, 2);
    }
}
