//! In-flight call tracking for request coalescing.
//!
//! The first call for a key becomes the leader and is responsible for settling the flight. Calls arriving while the
//! flight is open become waiters and receive a clone of whatever the leader settles with. A leader that is dropped
//! without settling releases its waiters with an error instead of leaving them hanging.

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::anyhow;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::trace;

use crate::error::FieldResult;

type Outcome = Option<FieldResult>;

struct Flight {
    id: u64,
    rx: watch::Receiver<Outcome>,
}

#[derive(Default)]
pub(crate) struct InFlight {
    flights: Mutex<HashMap<String, Flight>>,
    next_id: AtomicU64,
}

pub(crate) enum Slot {
    Leader(FlightGuard),
    Waiter(Waiter),
}

impl InFlight {
    pub(crate) fn join(&self, key: &str) -> Option<Waiter> {
        self.flights.lock().get(key).map(|flight| Waiter {
            rx: flight.rx.clone(),
        })
    }

    pub(crate) fn acquire(self: &Arc<Self>, key: &str) -> Slot {
        let mut flights = self.flights.lock();
        if let Some(flight) = flights.get(key) {
            return Slot::Waiter(Waiter {
                rx: flight.rx.clone(),
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(None);
        flights.insert(key.to_string(), Flight { id, rx });
        trace!("flight #{id} opened for '{key}'");

        Slot::Leader(FlightGuard {
            registry: Arc::clone(self),
            key: key.to_string(),
            id,
            tx: Some(tx),
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.flights.lock().len()
    }

    fn close(&self, key: &str, id: u64) {
        let mut flights = self.flights.lock();
        // The key could have been taken over by a newer flight already.
        if flights.get(key).is_some_and(|flight| flight.id == id) {
            flights.remove(key);
            trace!("flight #{id} closed for '{key}'");
        }
    }
}

pub(crate) struct FlightGuard {
    registry: Arc<InFlight>,
    key:      String,
    id:       u64,
    tx:       Option<watch::Sender<Outcome>>,
}

impl FlightGuard {
    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    /// A waiter on the leader's own flight.
    pub(crate) fn waiter(&self) -> Waiter {
        Waiter {
            rx: self
                .tx
                .as_ref()
                .map_or_else(|| watch::channel(None).1, |tx| tx.subscribe()),
        }
    }

    pub(crate) fn settle(mut self, result: FieldResult) {
        self.finish(result);
    }

    fn finish(&mut self, result: FieldResult) {
        if let Some(tx) = self.tx.take() {
            tx.send_replace(Some(result));
            self.registry.close(&self.key, self.id);
        }
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if self.tx.is_some() {
            self.finish(Err(Arc::new(anyhow!("computation of '{}' was abandoned", self.key))));
        }
    }
}

pub(crate) struct Waiter {
    rx: watch::Receiver<Outcome>,
}

impl Waiter {
    pub(crate) async fn wait(mut self) -> FieldResult {
        match self.rx.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome)
                .clone()
                .unwrap_or_else(|| Err(Arc::new(anyhow!("flight settled without a result")))),
            Err(_) => Err(Arc::new(anyhow!("flight closed without a result"))),
        }
    }
}
