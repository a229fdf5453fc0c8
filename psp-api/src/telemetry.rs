use std::sync::Arc;
use std::sync::Mutex;

use serde::Deserialize;
use serde::Serialize;

/// In-process operational counters for the facade. Cheap to clone; every
/// clone shares the same tallies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetryCounters {
    pub batches_committed: usize,
    pub batches_blocked: usize,
    pub payments_submitted: usize,
    pub payments_failed: usize,
    pub payments_returned: usize,
    pub settlements_processed: usize,
    pub settlements_matched: usize,
    pub callbacks_processed: usize,
    pub callbacks_deduplicated: usize,
}

#[derive(Clone, Default)]
pub struct PspTelemetry {
    inner: Arc<Mutex<TelemetryCounters>>,
}

impl PspTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&self, update: impl FnOnce(&mut TelemetryCounters)) {
        if let Ok(mut counters) = self.inner.lock() {
            update(&mut counters);
        }
    }

    pub fn record_batch_committed(&self) {
        self.bump(|counters| counters.batches_committed += 1);
    }

    pub fn record_batch_blocked(&self) {
        self.bump(|counters| counters.batches_blocked += 1);
    }

    pub fn record_payment_submitted(&self) {
        self.bump(|counters| counters.payments_submitted += 1);
    }

    pub fn record_payment_failed(&self) {
        self.bump(|counters| counters.payments_failed += 1);
    }

    pub fn record_payment_returned(&self) {
        self.bump(|counters| counters.payments_returned += 1);
    }

    pub fn record_settlements(&self, processed: usize, matched: usize) {
        self.bump(|counters| {
            counters.settlements_processed += processed;
            counters.settlements_matched += matched;
        });
    }

    pub fn record_callback_processed(&self) {
        self.bump(|counters| counters.callbacks_processed += 1);
    }

    pub fn record_callback_deduplicated(&self) {
        self.bump(|counters| counters.callbacks_deduplicated += 1);
    }

    pub fn snapshot(&self) -> TelemetryCounters {
        self.inner
            .lock()
            .map(|counters| counters.clone())
            .unwrap_or_default()
    }
}
