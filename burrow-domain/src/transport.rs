use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

use super::error::Result;
use super::target::Target;

// ---------------------------------------------------------------------------
// TunnelStream
// ---------------------------------------------------------------------------

/// A single logical byte stream multiplexed over a transport client.
///
/// Implements [`AsyncRead`] + [`AsyncWrite`] so the front-ends and the
/// decorator chain above it are transport-agnostic. Dropping the stream
/// closes the channel.
pub trait TunnelStream: AsyncRead + AsyncWrite + Send + Unpin {
    // ---
    /// Identifier used in logs. Unique per opened stream.
    fn stream_id(&self) -> Uuid;
}

// ---

/// Convenience type alias for a heap-allocated [`TunnelStream`].
pub type TunnelStreamPtr = Box<dyn TunnelStream>;

/// Shared handle to a live [`TransportClient`].
///
/// Shared rather than boxed: the session manager hands out snapshots to
/// callers and monitors, and compares them by pointer to tell whether a
/// failure report concerns the client that is still installed.
pub type TransportClientPtr = Arc<dyn TransportClient>;

// ---------------------------------------------------------------------------
// TransportClient
// ---------------------------------------------------------------------------

/// One live authenticated multiplexed connection to the remote host.
///
/// Reconnection is *not* this layer's concern: a client that dies stays
/// dead, and the session manager replaces it with a fresh one.
#[async_trait]
pub trait TransportClient: Send + Sync {
    // ---
    /// Open a logical stream that the remote side connects to `target`.
    ///
    /// Returns [`TunnelError::Refused`](crate::TunnelError::Refused) when the
    /// remote explicitly declines the channel; any other error means the
    /// connection itself is in trouble.
    async fn open_stream(&self, target: &Target) -> Result<TunnelStreamPtr>;

    /// Send a keepalive probe and wait for the transport to accept it.
    async fn keepalive(&self) -> Result<()>;

    /// Resolve once the connection has terminated, for any reason.
    async fn wait_closed(&self);

    /// `true` once the connection has terminated.
    fn is_closed(&self) -> bool;

    /// Tear the connection down. Idempotent.
    async fn close(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// TunnelTransport
// ---------------------------------------------------------------------------

/// Factory for [`TransportClient`]s.
///
/// Each call performs a fresh raw dial plus handshake and authentication.
/// Implementations: `burrow_ssh::SshTransport`, `burrow_link_sim::SimTransport`.
#[async_trait]
pub trait TunnelTransport: Send + Sync {
    // ---
    async fn connect(&self, remote: &Target) -> Result<TransportClientPtr>;
}
