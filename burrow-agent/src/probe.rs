//! Channel capacity prober.
//!
//! Opens as many disposable streams as the remote will grant, in parallel,
//! and reports how many it got. The remote's first explicit refusal marks
//! the ceiling. Every opened stream is closed again before returning.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::task::JoinSet;

use burrow_domain::{Target, TransportClientPtr, TunnelStreamPtr};

// ---

/// Measured values below this are treated as implausible.
pub const PLAUSIBLE_FLOOR: u32 = 4;

/// Ceiling used when the measurement is implausible.
pub const SAFE_DEFAULT: u32 = 10;

// ---------------------------------------------------------------------------
// ProbeConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    // ---
    /// Concurrent worker tasks.
    pub workers: usize,

    /// Total open attempts across all workers.
    pub safety_cap: usize,

    pub attempt_timeout: Duration,
    pub overall_timeout: Duration,

    /// Stable destinations; worker `i` uses `targets[i % len]`.
    pub targets: Vec<Target>,
}

// ---

impl Default for ProbeConfig {
    fn default() -> Self {
        // ---
        Self {
            workers: 256,
            safety_cap: 512,
            attempt_timeout: Duration::from_secs(2),
            overall_timeout: Duration::from_secs(10),
            targets: vec![Target::new("1.1.1.1", 443), Target::new("8.8.8.8", 443)],
        }
    }
}

// ---------------------------------------------------------------------------
// probe
// ---------------------------------------------------------------------------

/// Count how many concurrent streams `client` will open.
pub async fn probe(client: &TransportClientPtr, cfg: &ProbeConfig) -> u32 {
    // ---
    if cfg.targets.is_empty() || cfg.workers == 0 {
        return 0;
    }

    let stop = Arc::new(AtomicBool::new(false));
    let attempts = Arc::new(AtomicUsize::new(0));
    let opened: Arc<Mutex<Vec<TunnelStreamPtr>>> = Arc::new(Mutex::new(Vec::new()));

    let mut workers = JoinSet::new();
    for i in 0..cfg.workers {
        let worker = Worker {
            client: Arc::clone(client),
            target: cfg.targets[i % cfg.targets.len()].clone(),
            attempt_timeout: cfg.attempt_timeout,
            safety_cap: cfg.safety_cap,
            stop: Arc::clone(&stop),
            attempts: Arc::clone(&attempts),
            opened: Arc::clone(&opened),
        };
        workers.spawn(worker.run());
    }

    let drained = tokio::time::timeout(cfg.overall_timeout, async {
        while workers.join_next().await.is_some() {}
    })
    .await;

    if drained.is_err() {
        tracing::warn!(timeout = ?cfg.overall_timeout, "probe timed out, using partial count");
        workers.abort_all();
        while workers.join_next().await.is_some() {}
    }

    let streams = std::mem::take(&mut *opened.lock().unwrap_or_else(PoisonError::into_inner));
    let count = streams.len();
    for mut stream in streams {
        let _ = stream.shutdown().await;
    }

    tracing::debug!(count, attempts = attempts.load(Ordering::Acquire), "probe finished");
    u32::try_from(count).unwrap_or(u32::MAX)
}

// ---

/// Replace an implausibly small measurement with [`SAFE_DEFAULT`].
pub fn effective_ceiling(measured: u32) -> u32 {
    // ---
    if measured < PLAUSIBLE_FLOOR {
        tracing::warn!(measured, default = SAFE_DEFAULT, "probe result implausible");
        SAFE_DEFAULT
    } else {
        measured
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

struct Worker {
    // ---
    client: TransportClientPtr,
    target: Target,
    attempt_timeout: Duration,
    safety_cap: usize,
    stop: Arc<AtomicBool>,
    attempts: Arc<AtomicUsize>,
    opened: Arc<Mutex<Vec<TunnelStreamPtr>>>,
}

// ---

impl Worker {
    // ---
    async fn run(self) {
        // ---
        while !self.stop.load(Ordering::Acquire) {
            if self.attempts.fetch_add(1, Ordering::AcqRel) >= self.safety_cap {
                return;
            }

            let open = self.client.open_stream(&self.target);
            match tokio::time::timeout(self.attempt_timeout, open).await {
                Ok(Ok(stream)) => {
                    self.opened
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(stream);
                }
                Ok(Err(e)) if e.is_refusal() => {
                    tracing::trace!("probe hit ceiling: {e}");
                    self.stop.store(true, Ordering::Release);
                }
                Ok(Err(e)) => {
                    tracing::debug!("probe inconclusive: {e}");
                    self.stop.store(true, Ordering::Release);
                }
                Err(_) => {
                    tracing::debug!(target = %self.target, "probe attempt timed out");
                    self.stop.store(true, Ordering::Release);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use burrow_domain::{Target, TunnelTransport};
    use burrow_link_sim::{SimConfig, SimTransport};

    use super::{effective_ceiling, probe, ProbeConfig, SAFE_DEFAULT};

    // ---

    async fn probe_limit(config: SimConfig) -> (u32, usize) {
        // ---
        let transport = SimTransport::new(config);
        let client = transport.connect(&Target::new("sim", 22)).await.unwrap();
        let measured = probe(&client, &ProbeConfig::default()).await;

        let sim = transport.control().latest().unwrap();
        (measured, sim.open_channels())
    }

    // ---

    #[tokio::test]
    async fn probe_finds_the_remote_limit() {
        // ---
        let (measured, still_open) = probe_limit(SimConfig::limited(20)).await;
        assert_eq!(measured, 20);
        assert_eq!(effective_ceiling(measured), 20);
        assert_eq!(still_open, 0, "probe must close every stream it opened");
    }

    // ---

    #[tokio::test]
    async fn implausible_limit_falls_back_to_default() {
        // ---
        let (measured, _) = probe_limit(SimConfig::limited(2)).await;
        assert_eq!(measured, 2);
        assert_eq!(effective_ceiling(measured), SAFE_DEFAULT);
    }

    // ---

    #[tokio::test]
    async fn unlimited_remote_stops_at_safety_cap() {
        // ---
        let (measured, still_open) = probe_limit(SimConfig::unlimited()).await;
        assert_eq!(measured, 512);
        assert_eq!(still_open, 0);
    }

    // ---

    #[test]
    fn plausible_values_pass_through() {
        assert_eq!(effective_ceiling(4), 4);
        assert_eq!(effective_ceiling(0), SAFE_DEFAULT);
        assert_eq!(effective_ceiling(300), 300);
    }
}
