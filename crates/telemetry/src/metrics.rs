//! Internal metrics collection.
//!
//! Counters are collected in-memory; anything that ships them elsewhere is
//! a pluggable observer outside the core.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// A counter metric.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_by(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn reset(&self) -> u64 {
        self.0.swap(0, Ordering::Relaxed)
    }
}

/// A gauge metric (can go up or down).
#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn set(&self, val: u64) {
        self.0.store(val, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Histogram for latency tracking.
#[derive(Debug)]
pub struct Histogram {
    /// Buckets: 1ms, 5ms, 10ms, 25ms, 50ms, 100ms, 250ms, 500ms, 1s, 5s, 10s
    buckets: [AtomicU64; 11],
    sum: AtomicU64,
    count: AtomicU64,
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

impl Histogram {
    const BUCKET_BOUNDS: [u64; 11] = [1, 5, 10, 25, 50, 100, 250, 500, 1000, 5000, 10000];

    pub fn new() -> Self {
        Self {
            buckets: Default::default(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Records a value in milliseconds.
    pub fn observe(&self, ms: u64) {
        self.sum.fetch_add(ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        for (i, &bound) in Self::BUCKET_BOUNDS.iter().enumerate() {
            if ms <= bound {
                self.buckets[i].fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        // Value exceeds all buckets, add to last
        self.buckets[10].fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    pub fn mean(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            0.0
        } else {
            self.sum() as f64 / count as f64
        }
    }

    /// Returns bucket counts.
    pub fn buckets(&self) -> Vec<(u64, u64)> {
        Self::BUCKET_BOUNDS
            .iter()
            .zip(self.buckets.iter())
            .map(|(&bound, count)| (bound, count.load(Ordering::Relaxed)))
            .collect()
    }
}

/// Collected metrics for the broker.
#[derive(Debug, Default)]
pub struct Metrics {
    // Request path
    pub requests_received: Counter,
    pub responses_sent: Counter,
    pub bytes_in: Counter,
    pub bytes_out: Counter,
    pub protocol_errors: Counter,

    // Produce / fetch
    pub batches_appended: Counter,
    pub produce_errors: Counter,
    pub fetches_served: Counter,
    pub fetches_parked: Counter,

    // Replication & cluster
    pub replica_fetches: Counter,
    pub truncations: Counter,
    pub isr_shrinks: Counter,
    pub isr_expands: Counter,
    pub leader_elections: Counter,

    // Coordination
    pub rebalances_started: Counter,
    pub rebalances_completed: Counter,
    pub offsets_committed: Counter,
    pub txns_committed: Counter,
    pub txns_aborted: Counter,

    // Latency histograms
    pub produce_latency_ms: Histogram,
    pub fetch_latency_ms: Histogram,
    pub commit_apply_latency_ms: Histogram,

    // Gauges
    pub active_connections: Gauge,
    pub partitions_hosted: Gauge,
    pub under_replicated_partitions: Gauge,
    pub active_groups: Gauge,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }
}

/// A snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub requests_received: u64,
    pub responses_sent: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub batches_appended: u64,
    pub fetches_served: u64,
    pub replica_fetches: u64,
    pub rebalances_completed: u64,
    pub offsets_committed: u64,
    pub txns_committed: u64,
    pub txns_aborted: u64,
    pub produce_latency_mean_ms: f64,
    pub fetch_latency_mean_ms: f64,
    pub active_connections: u64,
    pub partitions_hosted: u64,
    pub under_replicated_partitions: u64,
    pub active_groups: u64,
}

impl Metrics {
    /// Takes a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: Utc::now(),
            requests_received: self.requests_received.get(),
            responses_sent: self.responses_sent.get(),
            bytes_in: self.bytes_in.get(),
            bytes_out: self.bytes_out.get(),
            batches_appended: self.batches_appended.get(),
            fetches_served: self.fetches_served.get(),
            replica_fetches: self.replica_fetches.get(),
            rebalances_completed: self.rebalances_completed.get(),
            offsets_committed: self.offsets_committed.get(),
            txns_committed: self.txns_committed.get(),
            txns_aborted: self.txns_aborted.get(),
            produce_latency_mean_ms: self.produce_latency_ms.mean(),
            fetch_latency_mean_ms: self.fetch_latency_ms.mean(),
            active_connections: self.active_connections.get(),
            partitions_hosted: self.partitions_hosted.get(),
            under_replicated_partitions: self.under_replicated_partitions.get(),
            active_groups: self.active_groups.get(),
        }
    }
}

/// Global metrics registry.
pub static METRICS: std::sync::LazyLock<Metrics> = std::sync::LazyLock::new(Metrics::new);

/// Get the global metrics instance.
pub fn metrics() -> &'static Metrics {
    &METRICS
}
