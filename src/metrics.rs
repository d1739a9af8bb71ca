use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide engine counters.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub readings_accepted: AtomicU64,
    pub readings_rejected: AtomicU64,
    pub persist_written: AtomicU64,
    /// Jobs refused because the persistence queue was full
    pub persist_dropped: AtomicU64,
    /// Jobs given up on after retries or at shutdown
    pub persist_failed: AtomicU64,
    pub snapshots_computed: AtomicU64,
    pub snapshots_published: AtomicU64,
    pub ticks_skipped: AtomicU64,
    pub tick_failures: AtomicU64,
    pub lookup_failures: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub readings_accepted: u64,
    pub readings_rejected: u64,
    pub persist_written: u64,
    pub persist_dropped: u64,
    pub persist_failed: u64,
    pub snapshots_computed: u64,
    pub snapshots_published: u64,
    pub ticks_skipped: u64,
    pub tick_failures: u64,
    pub lookup_failures: u64,
}

impl EngineMetrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            readings_accepted: get(&self.readings_accepted),
            readings_rejected: get(&self.readings_rejected),
            persist_written: get(&self.persist_written),
            persist_dropped: get(&self.persist_dropped),
            persist_failed: get(&self.persist_failed),
            snapshots_computed: get(&self.snapshots_computed),
            snapshots_published: get(&self.snapshots_published),
            ticks_skipped: get(&self.ticks_skipped),
            tick_failures: get(&self.tick_failures),
            lookup_failures: get(&self.lookup_failures),
        }
    }
}
