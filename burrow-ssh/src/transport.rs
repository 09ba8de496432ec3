//! [`SshTransport`]: factory for [`SshClient`]s.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;

use burrow_domain::{
    // ---
    Result,
    Target,
    TransportClientPtr,
    TunnelError,
    TunnelTransport,
};

use crate::auth::AuthConfig;
use crate::client::{SessionHandler, SshClient};
use crate::error::SshError;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
const KEEPALIVE_MAX: usize = 3;

// ---------------------------------------------------------------------------
// SshTransport
// ---------------------------------------------------------------------------

pub struct SshTransport {
    // ---
    auth: AuthConfig,
    config: Arc<russh::client::Config>,
}

// ---

impl SshTransport {
    // ---
    pub fn new(auth: AuthConfig) -> Self {
        // ---
        // The session manager runs its own keepalive ticker on top of this.
        // russh's keepalives close the session after KEEPALIVE_MAX unanswered
        // requests even while no channel traffic flows.
        let config = russh::client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(KEEPALIVE_INTERVAL),
            keepalive_max: KEEPALIVE_MAX,
            ..Default::default()
        };
        Self {
            auth,
            config: Arc::new(config),
        }
    }

    // ---

    pub fn auth(&self) -> &AuthConfig {
        &self.auth
    }
}

// ---

#[async_trait]
impl TunnelTransport for SshTransport {
    // ---
    /// Raw TCP dial, SSH handshake, then authentication. The caller bounds
    /// the whole sequence with its own dial timeout.
    async fn connect(&self, remote: &Target) -> Result<TransportClientPtr> {
        // ---
        let addr = (remote.host.as_str(), remote.port);
        let tcp = TcpStream::connect(addr).await.map_err(|source| SshError::Dial {
            remote: remote.to_string(),
            source,
        })?;
        if let Err(e) = tcp.set_nodelay(true) {
            tracing::debug!(%remote, "set_nodelay failed: {e}");
        }

        let (handler, closed_rx) = SessionHandler::new();
        let mut handle = russh::client::connect_stream(Arc::clone(&self.config), tcp, handler)
            .await
            .map_err(SshError::from)?;

        if let Err(e) = self.auth.authenticate(&mut handle).await {
            let _ = handle
                .disconnect(russh::Disconnect::ByApplication, "", "English")
                .await;
            return Err(TunnelError::from(e));
        }

        tracing::info!(%remote, user = %self.auth.user, "ssh session established");
        Ok(Arc::new(SshClient::new(remote.clone(), handle, closed_rx)))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
