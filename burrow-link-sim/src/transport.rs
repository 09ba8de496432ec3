use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;
use tokio::time::Instant;

use burrow_domain::{Result, Target, TransportClientPtr, TunnelError, TunnelTransport};

use super::client::SimClient;
use super::config::SimConfig;

// ---------------------------------------------------------------------------
// ControlState
// ---------------------------------------------------------------------------

/// State shared between a [`SimTransport`], its clients and every
/// [`SimControl`] handle.
#[derive(Default)]
pub(crate) struct ControlState {
    // ---
    /// Dials still to fail before one succeeds.
    pub(crate) fail_next: AtomicUsize,

    /// When set, every keepalive on every client hangs forever.
    pub(crate) keepalive_hang: AtomicBool,

    /// Total `open_stream` calls across all clients.
    pub(crate) opens: AtomicUsize,

    /// Tokio-clock timestamp of every dial attempt, in order.
    pub(crate) dials: Mutex<Vec<Instant>>,

    /// Every client handed out, most recent last. Weak so that a client
    /// holding this state does not keep itself alive.
    pub(crate) clients: Mutex<Vec<Weak<SimClient>>>,
}

// ---------------------------------------------------------------------------
// SimControl
// ---------------------------------------------------------------------------

/// Cheap-clone fault injection and inspection handle.
#[derive(Clone)]
pub struct SimControl {
    // ---
    state: Arc<ControlState>,
}

// ---

impl SimControl {
    // ---
    /// Make the next `n` dials fail with a transport error.
    pub fn fail_next_dials(&self, n: usize) {
        self.state.fail_next.store(n, Ordering::Release);
    }

    // ---

    /// Make keepalives hang (`true`) or answer normally (`false`).
    pub fn hang_keepalives(&self, hang: bool) {
        self.state.keepalive_hang.store(hang, Ordering::Release);
    }

    // ---

    /// Number of dial attempts so far, failed ones included.
    pub fn dial_attempts(&self) -> usize {
        lock(&self.state.dials).len()
    }

    // ---

    /// Tokio-clock timestamps of every dial attempt.
    pub fn dial_times(&self) -> Vec<Instant> {
        lock(&self.state.dials).clone()
    }

    // ---

    /// Total `open_stream` calls, including refused and probe opens.
    pub fn open_calls(&self) -> usize {
        self.state.opens.load(Ordering::Acquire)
    }

    // ---

    /// Number of clients successfully handed out.
    pub fn clients_created(&self) -> usize {
        lock(&self.state.clients).len()
    }

    // ---

    /// Most recently created client, if it is still alive.
    pub fn latest(&self) -> Option<Arc<SimClient>> {
        lock(&self.state.clients).last().and_then(Weak::upgrade)
    }

    // ---

    /// Kill the most recently created client.
    pub fn kill_latest(&self) {
        // ---
        if let Some(client) = self.latest() {
            client.kill();
        }
    }
}

// ---------------------------------------------------------------------------
// SimTransport
// ---------------------------------------------------------------------------

/// In-process simulated transport. Does not open sockets.
pub struct SimTransport {
    // ---
    config: SimConfig,
    state: Arc<ControlState>,
}

// ---

impl SimTransport {
    // ---
    pub fn new(config: SimConfig) -> Self {
        // ---
        Self {
            config,
            state: Arc::new(ControlState::default()),
        }
    }

    // ---

    /// Fault-injection handle sharing this transport's state.
    pub fn control(&self) -> SimControl {
        SimControl {
            state: Arc::clone(&self.state),
        }
    }
}

// ---

#[async_trait]
impl TunnelTransport for SimTransport {
    // ---
    async fn connect(&self, remote: &Target) -> Result<TransportClientPtr> {
        // ---
        lock(&self.state.dials).push(Instant::now());

        let failed = self
            .state
            .fail_next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            tracing::debug!(%remote, "sim dial failure injected");
            return Err(TunnelError::Transport(format!("connection refused: {remote}")));
        }

        let client = Arc::new(SimClient::new(self.config.clone(), Arc::clone(&self.state)));
        lock(&self.state.clients).push(Arc::downgrade(&client));
        Ok(client)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
