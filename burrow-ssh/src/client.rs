//! [`SshClient`]: a live SSH session implementing [`TransportClient`].
//!
//! Thin wrapper around a [`russh::client::Handle`]. Reconnection lives above
//! this layer in the agent's session manager.

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::Disconnect;
use tokio::sync::watch;
use uuid::Uuid;

use burrow_domain::{
    // ---
    Result,
    Target,
    TransportClient,
    TunnelError,
    TunnelStream,
    TunnelStreamPtr,
};

use crate::error::SshError;
use crate::stream::SshStream;

/// Bind address named in the keepalive request. No such forward ever exists.
const KEEPALIVE_ADDRESS: &str = "keepalive.burrow.invalid";

// ---------------------------------------------------------------------------
// SessionHandler
// ---------------------------------------------------------------------------

/// russh client callbacks. Owned by the session's background task, so its
/// drop marks the end of the connection.
pub(crate) struct SessionHandler {
    // ---
    closed_tx: watch::Sender<bool>,
}

// ---

impl SessionHandler {
    // ---
    pub(crate) fn new() -> (Self, watch::Receiver<bool>) {
        // ---
        let (closed_tx, closed_rx) = watch::channel(false);
        (Self { closed_tx }, closed_rx)
    }
}

// ---

impl Drop for SessionHandler {
    fn drop(&mut self) {
        self.closed_tx.send_replace(true);
    }
}

// ---

#[async_trait]
impl client::Handler for SessionHandler {
    // ---
    type Error = russh::Error;

    /// Host keys are accepted without pinning; the proxy authenticates the
    /// user, not the server.
    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// SshClient
// ---------------------------------------------------------------------------

/// One authenticated SSH session to the remote host.
pub struct SshClient {
    // ---
    id: Uuid,
    remote: Target,
    handle: Handle<SessionHandler>,
    closed_rx: watch::Receiver<bool>,
}

// ---

impl SshClient {
    // ---
    pub(crate) fn new(
        remote: Target,
        handle: Handle<SessionHandler>,
        closed_rx: watch::Receiver<bool>,
    ) -> Self {
        // ---
        Self {
            id: Uuid::new_v4(),
            remote,
            handle,
            closed_rx,
        }
    }

    // ---

    pub fn id(&self) -> Uuid {
        self.id
    }
}

// ---

#[async_trait]
impl TransportClient for SshClient {
    // ---
    async fn open_stream(&self, target: &Target) -> Result<TunnelStreamPtr> {
        // ---
        if self.is_closed() {
            return Err(TunnelError::SessionClosed);
        }

        let channel = self
            .handle
            .channel_open_direct_tcpip(target.host.clone(), u32::from(target.port), "127.0.0.1", 0)
            .await
            .map_err(SshError::from)?;

        let stream = SshStream::new(channel.into_stream());
        tracing::trace!(session = %self.id, %target, stream = %stream.stream_id(), "channel open");
        Ok(Box::new(stream))
    }

    // ---

    async fn keepalive(&self) -> Result<()> {
        // ---
        if self.is_closed() {
            return Err(TunnelError::SessionClosed);
        }
        // A want-reply global request the server must answer. Cancelling a
        // forward that was never requested is answered with a failure, which
        // still proves the peer is alive.
        let res = self
            .handle
            .cancel_tcpip_forward(KEEPALIVE_ADDRESS, 0)
            .await;
        keepalive_outcome(res)
    }

    // ---

    async fn wait_closed(&self) {
        // ---
        let mut rx = self.closed_rx.clone();
        // Err means the handler is gone, which is also closed.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    // ---

    fn is_closed(&self) -> bool {
        *self.closed_rx.borrow() || self.handle.is_closed()
    }

    // ---

    async fn close(&self) -> Result<()> {
        // ---
        if self.is_closed() {
            return Ok(());
        }
        tracing::debug!(session = %self.id, remote = %self.remote, "disconnecting");
        // A session that died meanwhile reports an error here; either way it
        // is gone.
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Any answer from the server, success or failure, counts as alive.
fn keepalive_outcome(res: std::result::Result<(), russh::Error>) -> Result<()> {
    // ---
    match res {
        Ok(()) | Err(russh::Error::RequestDenied) => Ok(()),
        Err(e) => Err(SshError::from(e).into()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use russh::server::{self, Auth};
    use tokio::net::TcpListener;

    use burrow_domain::{Target, TransportClient, TunnelError, TunnelTransport};

    use super::keepalive_outcome;
    use crate::{AuthConfig, SshTransport};

    // ---

    struct AcceptAll;

    #[async_trait]
    impl server::Handler for AcceptAll {
        // ---
        type Error = russh::Error;

        async fn auth_password(&mut self, _user: &str, _password: &str) -> Result<Auth, Self::Error> {
            Ok(Auth::Accept)
        }
    }

    // ---

    /// One-connection sshd on loopback. Returns its port and the server-side
    /// session handle once a client has connected.
    async fn spawn_sshd() -> (u16, tokio::sync::oneshot::Receiver<server::Handle>) {
        // ---
        let config = Arc::new(server::Config {
            keys: vec![russh_keys::key::KeyPair::generate_ed25519().unwrap()],
            auth_rejection_time: Duration::ZERO,
            ..Default::default()
        });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (handle_tx, handle_rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let running = server::run_stream(config, socket, AcceptAll).await.unwrap();
            let _ = handle_tx.send(running.handle());
            let _ = running.await;
        });
        (port, handle_rx)
    }

    // ---

    #[test]
    fn denied_request_still_counts_as_alive() {
        // ---
        assert!(keepalive_outcome(Ok(())).is_ok());
        assert!(keepalive_outcome(Err(russh::Error::RequestDenied)).is_ok());

        let err = keepalive_outcome(Err(russh::Error::Disconnect)).unwrap_err();
        assert!(matches!(err, TunnelError::SessionClosed));
        assert!(keepalive_outcome(Err(russh::Error::SendError)).is_err());
    }

    // ---

    #[tokio::test]
    async fn keepalive_waits_for_server_and_fails_after_disconnect() {
        // ---
        let (port, handle_rx) = spawn_sshd().await;
        let transport = SshTransport::new(AuthConfig::new("tester").with_password("pw"));
        let client = transport
            .connect(&Target::new("127.0.0.1", port))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), client.keepalive())
            .await
            .expect("server answered the keepalive")
            .unwrap();

        let server_side = handle_rx.await.unwrap();
        let _ = server_side
            .disconnect(russh::Disconnect::ByApplication, "bye".into(), "en".into())
            .await;

        tokio::time::timeout(Duration::from_secs(5), client.wait_closed())
            .await
            .expect("client noticed the disconnect");
        assert!(client.is_closed());
        assert!(client.keepalive().await.is_err());
    }
}
