//! Error types for `burrow-ssh`.

use thiserror::Error;

use burrow_domain::TunnelError;

#[derive(Debug, Error)]
pub enum SshError {
    // ---
    #[error("ssh protocol error: {0}")]
    Protocol(#[from] russh::Error),

    #[error("loading private key: {0}")]
    Key(#[from] russh_keys::Error),

    #[error("authentication rejected for user {user:?}")]
    AuthRejected { user: String },

    #[error("no credentials configured: need a password or a private key")]
    NoCredentials,

    #[error("tcp dial to {remote} failed: {source}")]
    Dial {
        remote: String,
        #[source]
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// Bridge to burrow_domain::TunnelError
// ---------------------------------------------------------------------------

impl From<SshError> for TunnelError {
    // ---
    fn from(e: SshError) -> Self {
        match e {
            SshError::Protocol(russh::Error::ChannelOpenFailure(reason)) => TunnelError::Refused {
                reason: format!("{reason:?}"),
            },
            SshError::Protocol(russh::Error::Disconnect) => TunnelError::SessionClosed,
            other => TunnelError::Transport(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
