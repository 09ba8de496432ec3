use thiserror::Error;

// ---

/// Failure reported by a transport client or one of its streams.
///
/// The split that matters to the session manager is between
/// [`TunnelError::Refused`] (the transport is healthy, the remote declined
/// this one channel) and everything else (the transport itself is suspect
/// and should be re-established).
#[derive(Debug, Error)]
pub enum TunnelError {
    // ---
    #[error("transport error: {0}")]
    Transport(String),

    #[error("channel refused by remote: {reason}")]
    Refused { reason: String },

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("session closed")]
    SessionClosed,

    #[error("invalid target {0:?}")]
    InvalidTarget(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// ---

impl TunnelError {
    // ---
    /// The remote explicitly declined to open a channel.
    pub fn is_refusal(&self) -> bool {
        matches!(self, TunnelError::Refused { .. })
    }

    // ---

    /// The failure implicates the transport connection rather than a single
    /// request, so a reconnect is the right response.
    pub fn is_transport_failure(&self) -> bool {
        // ---
        match self {
            TunnelError::Transport(_)
            | TunnelError::Timeout(_)
            | TunnelError::SessionClosed
            | TunnelError::Io(_) => true,
            TunnelError::Refused { .. } | TunnelError::InvalidTarget(_) => false,
        }
    }
}

// ---

pub type Result<T> = std::result::Result<T, TunnelError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
