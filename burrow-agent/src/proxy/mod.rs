//! Local proxy front-ends and the tunnel dialer they share.
//!
//! Front-ends never retry: [`TunnelDialer::dial`] is one call into
//! [`SessionManager::open_stream`](super::SessionManager::open_stream), which
//! already owns every retry and reconnect decision.

pub mod http;
pub mod socks;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

// ---

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

// ---

use burrow_domain::Target;

use super::{
    // ---
    ByteCounter,
    ChannelStream,
    ConnTracker,
    IdleTimeout,
    SessionError,
    SessionManager,
    TrafficCounters,
};

/// Bound on one upstream open, admission wait included.
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(15);

/// Tunneled connections with no traffic for this long are closed.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Hard cap on one relayed session.
pub const SESSION_LIFETIME: Duration = Duration::from_secs(60 * 60);

/// A stream with the full decorator chain applied.
pub type TunneledConn = ConnTracker<ByteCounter<IdleTimeout<ChannelStream>>>;

// ---------------------------------------------------------------------------
// DialError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum DialError {
    // ---
    #[error("IPv6 target rejected by policy")]
    Ipv6Rejected,

    #[error("upstream open timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Session(#[from] SessionError),
}

// ---------------------------------------------------------------------------
// TunnelDialer
// ---------------------------------------------------------------------------

pub struct TunnelDialer {
    // ---
    session: Arc<SessionManager>,
    counters: Arc<TrafficCounters>,
    allow_v6: bool,
    upstream_timeout: Duration,
    idle_timeout: Duration,
    shutdown: CancellationToken,
}

// ---

impl TunnelDialer {
    // ---
    pub fn new(
        session: Arc<SessionManager>,
        counters: Arc<TrafficCounters>,
        allow_v6: bool,
        shutdown: CancellationToken,
    ) -> Self {
        // ---
        Self {
            session,
            counters,
            allow_v6,
            upstream_timeout: UPSTREAM_TIMEOUT,
            idle_timeout: IDLE_TIMEOUT,
            shutdown,
        }
    }

    // ---

    pub fn with_timeouts(mut self, upstream: Duration, idle: Duration) -> Self {
        self.upstream_timeout = upstream;
        self.idle_timeout = idle;
        self
    }

    // ---

    /// Open a decorated stream to `dest`.
    pub async fn dial(&self, dest: &Target) -> Result<TunneledConn, DialError> {
        // ---
        if rejects_ipv6(dest, self.allow_v6) {
            return Err(DialError::Ipv6Rejected);
        }

        let cancel = self.shutdown.child_token();
        let open = self.session.open_stream(&cancel, "tcp", dest);
        let stream = match tokio::time::timeout(self.upstream_timeout, open).await {
            Ok(res) => res?,
            Err(_) => return Err(DialError::Timeout(self.upstream_timeout)),
        };

        let idle = IdleTimeout::new(stream, self.idle_timeout);
        let counted = ByteCounter::new(idle, Arc::clone(&self.counters));
        Ok(ConnTracker::new(counted, Arc::clone(&self.counters)))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// `true` when `dest` is an IPv6 literal and IPv6 is not allowed.
/// IPv4-mapped addresses count as IPv4; host names are never rejected here.
pub fn rejects_ipv6(dest: &Target, allow_v6: bool) -> bool {
    // ---
    if allow_v6 {
        return false;
    }
    match dest.ip() {
        Some(IpAddr::V6(v6)) => v6.to_ipv4_mapped().is_none(),
        _ => false,
    }
}

// ---

/// Copy both ways until either side closes or [`SESSION_LIFETIME`] ends.
pub(crate) async fn relay<A, B>(client: &mut A, upstream: &mut B, lifetime: Duration)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    // ---
    match tokio::time::timeout(lifetime, tokio::io::copy_bidirectional(client, upstream)).await {
        Ok(Ok((up, down))) => tracing::trace!(up, down, "relay finished"),
        Ok(Err(e)) => tracing::debug!("relay ended: {e}"),
        Err(_) => tracing::debug!(?lifetime, "relay lifetime reached"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    // ---
    use std::sync::Arc;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_util::sync::CancellationToken;

    use burrow_domain::{Target, TunnelTransport};
    use burrow_link_sim::{SimConfig, SimTransport};

    use super::super::{SessionManager, SessionOptions, TrafficCounters};
    use super::{rejects_ipv6, DialError, TunnelDialer};

    // ---

    /// Dialer over a simulated echo transport, for front-end tests.
    pub(crate) async fn sim_dialer() -> (Arc<TunnelDialer>, Arc<TrafficCounters>) {
        // ---
        let transport: Arc<dyn TunnelTransport> =
            Arc::new(SimTransport::new(SimConfig::unlimited()));
        let sm = SessionManager::connect(Target::new("sim", 22), transport, SessionOptions::default())
            .await
            .unwrap();
        let counters = TrafficCounters::new();
        let dialer = TunnelDialer::new(sm, counters.clone(), false, CancellationToken::new());
        (Arc::new(dialer), counters)
    }

    // ---

    #[test]
    fn ipv6_policy() {
        // ---
        let v6 = Target::new("2001:db8::1", 443);
        let mapped = Target::new("::ffff:10.0.0.1", 443);
        let v4 = Target::new("10.0.0.1", 443);
        let name = Target::new("example.com", 443);

        assert!(rejects_ipv6(&v6, false));
        assert!(!rejects_ipv6(&v6, true));
        assert!(!rejects_ipv6(&mapped, false));
        assert!(!rejects_ipv6(&v4, false));
        assert!(!rejects_ipv6(&name, false));
    }

    // ---

    #[tokio::test]
    async fn dial_applies_policy_and_decorators() {
        // ---
        let (dialer, counters) = sim_dialer().await;

        let err = dialer.dial(&Target::new("::1", 80)).await.err().unwrap();
        assert!(matches!(err, DialError::Ipv6Rejected));

        let mut conn = dialer.dial(&Target::new("example.com", 80)).await.unwrap();
        assert_eq!(counters.open_conns(), 1);

        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        assert_eq!(counters.swap_bytes(), 8);

        drop(conn);
        assert_eq!(counters.open_conns(), 0);
    }
}
