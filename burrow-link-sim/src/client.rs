use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

// ---

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use uuid::Uuid;

// ---

use burrow_domain::{
    // ---
    Result,
    Target,
    TransportClient,
    TunnelError,
    TunnelStream,
    TunnelStreamPtr,
};

// ---

use super::stream::OpenGuard;
use super::transport::ControlState;
use super::{SimConfig, SimStream};

// ---------------------------------------------------------------------------
// SimClient
// ---------------------------------------------------------------------------

/// In-process simulated transport client.
///
/// Created by [`super::SimTransport`]. Each stream it opens is backed by a
/// [`SimStream`] pair whose far end is served by a small task (echo or
/// sink, per [`SimConfig::echo`]). Killing the client ends all those tasks,
/// so every stream it opened sees EOF / `BrokenPipe`, just like channels on
/// a dropped SSH connection.
pub struct SimClient {
    // ---
    id: Uuid,
    config: SimConfig,

    /// Channels currently open on this client.
    open: Arc<AtomicUsize>,

    closed_tx: watch::Sender<bool>,
    control: Arc<ControlState>,
}

// ---

impl SimClient {
    // ---
    pub(crate) fn new(config: SimConfig, control: Arc<ControlState>) -> Self {
        // ---
        let (closed_tx, _) = watch::channel(false);
        Self {
            id: Uuid::new_v4(),
            config,
            open: Arc::new(AtomicUsize::new(0)),
            closed_tx,
            control,
        }
    }

    // ---

    /// Identifier of this client, for tests that track replacement.
    pub fn id(&self) -> Uuid {
        self.id
    }

    // ---

    /// Channels currently open on this client.
    pub fn open_channels(&self) -> usize {
        self.open.load(Ordering::Acquire)
    }

    // ---

    /// Simulate transport death: all streams break, `wait_closed` resolves.
    pub fn kill(&self) {
        // ---
        tracing::debug!(client = %self.id, "sim client killed");
        self.closed_tx.send_replace(true);
    }

    // ---

    /// Reserve a channel unless the simulated remote is at its limit.
    fn try_reserve(&self) -> Result<OpenGuard> {
        // ---
        let limit = self.config.channel_limit;
        self.open
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| match limit {
                Some(max) if n >= max => None,
                _ => Some(n + 1),
            })
            .map(|_| OpenGuard::new(Arc::clone(&self.open)))
            .map_err(|_| TunnelError::Refused {
                reason: "resource shortage".into(),
            })
    }
}

// ---

#[async_trait]
impl TransportClient for SimClient {
    // ---
    async fn open_stream(&self, target: &Target) -> Result<TunnelStreamPtr> {
        // ---
        self.control.opens.fetch_add(1, Ordering::AcqRel);

        if !self.config.open_latency.is_zero() {
            tokio::time::sleep(self.config.open_latency).await;
        }
        if self.is_closed() {
            return Err(TunnelError::SessionClosed);
        }

        let guard = self.try_reserve()?;
        let (near, far) = SimStream::pair(guard);

        tracing::trace!(client = %self.id, %target, stream = %near.stream_id(), "sim open");
        tokio::spawn(serve_far_end(far, self.config.echo, self.closed_tx.subscribe()));

        Ok(Box::new(near))
    }

    // ---

    async fn keepalive(&self) -> Result<()> {
        // ---
        if self.is_closed() {
            return Err(TunnelError::SessionClosed);
        }
        if self.control.keepalive_hang.load(Ordering::Acquire) {
            // An unresponsive peer: never answer.
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    // ---

    async fn wait_closed(&self) {
        // ---
        let mut rx = self.closed_tx.subscribe();
        // The sender lives in `self`; `wait_for` cannot see it dropped here.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    // ---

    fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    // ---

    async fn close(&self) -> Result<()> {
        // ---
        self.closed_tx.send_replace(true);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Far end
// ---------------------------------------------------------------------------

/// Serve the remote end of one stream until the near end goes away or the
/// client dies. Dropping `far` on exit is what breaks the near end.
async fn serve_far_end(mut far: SimStream, echo: bool, mut closed: watch::Receiver<bool>) {
    // ---
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        tokio::select! {
            _ = wait_dead(&mut closed) => return,
            read = far.read(&mut buf) => match read {
                Ok(0) | Err(_) => return,
                Ok(n) => {
                    if echo && far.write_all(&buf[..n]).await.is_err() {
                        return;
                    }
                }
            },
        }
    }
}

// ---

async fn wait_dead(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|c| *c).await;
}
