use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Run-wide counters shared by every worker through an `Arc`.
///
/// Reads taken while workers are running are only good for progress logging;
/// take a [`CountersSnapshot`] after the workers have joined for final numbers.
#[derive(Debug, Default)]
pub struct RunCounters {
    successes: AtomicU64,
    failures: AtomicU64,
    reconnections: AtomicU64,
    connections_opened: AtomicU64,
    connection_failures: AtomicU64,
    dequeued: AtomicU64,
    metrics_dropped: AtomicU64,
    stale_responses: AtomicU64,
}

impl RunCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnection(&self) {
        self.reconnections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_failure(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dequeued(&self) {
        self.dequeued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_metric_dropped(&self) {
        self.metrics_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_responses(&self, count: u64) {
        if count > 0 {
            self.stale_responses.fetch_add(count, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            successes: self.successes.load(Ordering::Acquire),
            failures: self.failures.load(Ordering::Acquire),
            reconnections: self.reconnections.load(Ordering::Acquire),
            connections_opened: self.connections_opened.load(Ordering::Acquire),
            connection_failures: self.connection_failures.load(Ordering::Acquire),
            dequeued: self.dequeued.load(Ordering::Acquire),
            metrics_dropped: self.metrics_dropped.load(Ordering::Acquire),
            stale_responses: self.stale_responses.load(Ordering::Acquire),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountersSnapshot {
    pub successes: u64,
    pub failures: u64,
    pub reconnections: u64,
    pub connections_opened: u64,
    pub connection_failures: u64,
    pub dequeued: u64,
    pub metrics_dropped: u64,
    pub stale_responses: u64,
}

impl CountersSnapshot {
    pub fn classified(&self) -> u64 {
        self.successes + self.failures
    }

    /// Counter deltas accumulated between `earlier` and `self`.
    pub fn since(&self, earlier: &CountersSnapshot) -> CountersSnapshot {
        CountersSnapshot {
            successes: self.successes - earlier.successes,
            failures: self.failures - earlier.failures,
            reconnections: self.reconnections - earlier.reconnections,
            connections_opened: self.connections_opened - earlier.connections_opened,
            connection_failures: self.connection_failures - earlier.connection_failures,
            dequeued: self.dequeued - earlier.dequeued,
            metrics_dropped: self.metrics_dropped - earlier.metrics_dropped,
            stale_responses: self.stale_responses - earlier.stale_responses,
        }
    }
}
