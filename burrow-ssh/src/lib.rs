//! SSH transport implementation for burrow.
//!
//! Implements [`burrow_domain::TunnelTransport`] using the `russh` crate.
//! Every logical stream is one `direct-tcpip` channel on a single
//! authenticated session; the remote sshd makes the outbound connection.
//!
//! # Quick start
//!
//! ```ignore
//! use burrow_domain::{Target, TunnelTransport};
//! use burrow_ssh::{AuthConfig, SshTransport};
//!
//! let auth      = AuthConfig::new("alice").with_key_path("~/.ssh/id_ed25519");
//! let transport = SshTransport::new(auth);
//! let client    = transport.connect(&Target::new("bastion.example", 22)).await?;
//! let stream    = client.open_stream(&Target::new("example.com", 443)).await?;
//! ```

mod auth;
mod client;
mod error;
mod stream;
mod transport;

pub use auth::AuthConfig;
pub use client::SshClient;
pub use error::SshError;
pub use stream::SshStream;
pub use transport::SshTransport;
