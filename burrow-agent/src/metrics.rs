//! Process-wide traffic counters and the periodic monitors that log them.
//!
//! Counters are shared through an injected `Arc<TrafficCounters>`; the
//! decorators in [`super::conn_track`] feed them.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// TrafficCounters
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct TrafficCounters {
    // ---
    /// Bytes moved in either direction since the last [`swap_bytes`](Self::swap_bytes).
    bytes: AtomicU64,

    /// Tunneled connections currently open.
    open_conns: AtomicI64,
}

// ---

impl TrafficCounters {
    // ---
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    // ---

    pub fn add_bytes(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::Relaxed);
    }

    // ---

    /// Read and reset the byte counter.
    pub fn swap_bytes(&self) -> u64 {
        self.bytes.swap(0, Ordering::AcqRel)
    }

    // ---

    pub fn conn_opened(&self) {
        self.open_conns.fetch_add(1, Ordering::AcqRel);
    }

    // ---

    pub fn conn_closed(&self) {
        self.open_conns.fetch_sub(1, Ordering::AcqRel);
    }

    // ---

    pub fn open_conns(&self) -> i64 {
        self.open_conns.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// Monitors
// ---------------------------------------------------------------------------

/// Throughput in megabits per second for `bytes` moved over `period`.
pub fn mbps(bytes: u64, period: Duration) -> f64 {
    // ---
    let secs = period.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    (bytes as f64 * 8.0) / (secs * 1e6)
}

// ---

/// Spawn the traffic and open-connection monitors. Both log at debug level
/// once per `period` until `shutdown` fires.
pub fn spawn_monitors(
    counters: Arc<TrafficCounters>,
    period: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    // ---
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {}
            }

            let bytes = counters.swap_bytes();
            tracing::debug!(mbps = mbps(bytes, period), bytes, "traffic");
            tracing::debug!(current = counters.open_conns(), "open_connections");
        }
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
