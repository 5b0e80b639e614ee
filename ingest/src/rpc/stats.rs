use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::info;

/// Wire-level counters shared by every batch of one client.
#[derive(Debug)]
pub struct RpcStats {
    wire_calls: AtomicU64,
    operations: AtomicU64,
    failed_calls: AtomicU64,
    latency_micros: AtomicU64,
    since: Mutex<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsSnapshot {
    pub wire_calls: u64,
    pub operations: u64,
    pub failed_calls: u64,
    pub average_latency: Duration,
    pub elapsed: Duration,
}

impl StatsSnapshot {
    pub fn calls_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.wire_calls as f64 / secs
        } else {
            0.0
        }
    }
}

impl Default for RpcStats {
    fn default() -> Self {
        Self {
            wire_calls: AtomicU64::new(0),
            operations: AtomicU64::new(0),
            failed_calls: AtomicU64::new(0),
            latency_micros: AtomicU64::new(0),
            since: Mutex::new(Instant::now()),
        }
    }
}

impl RpcStats {
    pub(crate) fn record(&self, operations: usize, latency: Duration, failed: bool) {
        self.wire_calls.fetch_add(1, Ordering::Relaxed);
        self.operations
            .fetch_add(operations as u64, Ordering::Relaxed);
        self.latency_micros
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        if failed {
            self.failed_calls.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let wire_calls = self.wire_calls.load(Ordering::Relaxed);
        let latency = self.latency_micros.load(Ordering::Relaxed);
        StatsSnapshot {
            wire_calls,
            operations: self.operations.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            average_latency: Duration::from_micros(latency.checked_div(wire_calls).unwrap_or(0)),
            elapsed: self.since.lock().elapsed(),
        }
    }

    /// Logs the counters accumulated since the previous call and starts a new
    /// period.
    pub fn log_and_reset(&self) -> StatsSnapshot {
        let snapshot = self.snapshot();
        self.wire_calls.store(0, Ordering::Relaxed);
        self.operations.store(0, Ordering::Relaxed);
        self.failed_calls.store(0, Ordering::Relaxed);
        self.latency_micros.store(0, Ordering::Relaxed);
        *self.since.lock() = Instant::now();

        if snapshot.wire_calls > 0 {
            info!(
                calls_per_second = format!("{:.1}", snapshot.calls_per_second()),
                operations = snapshot.operations,
                failed = snapshot.failed_calls,
                avg_latency_ms = snapshot.average_latency.as_millis() as u64,
                "rpc stats"
            );
        }
        snapshot
    }
}
