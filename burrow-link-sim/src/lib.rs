//! In-process simulated transport for burrow unit and integration testing.
//!
//! [`SimTransport`] implements [`burrow_domain::TunnelTransport`] using tokio
//! channels instead of an SSH connection. [`SimConfig`] shapes the simulated
//! remote and [`SimControl`] injects faults at run time:
//!
//! - Per-client channel limit (explicit refusal past the limit)
//! - Failing the next N dials
//! - Hanging keepalives
//! - Killing the current client (transport death)
//!
//! Every dial attempt is timestamped on the tokio clock so tests running
//! with paused time can assert on backoff spacing.
//!
//! # Quick start
//!
//! ```rust
//! use burrow_link_sim::{SimConfig, SimTransport};
//!
//! let transport = SimTransport::new(SimConfig::limited(8));
//! let control = transport.control();
//! control.fail_next_dials(3);
//! ```

mod client;
mod config;
mod stream;
mod transport;

// --- public API
pub use client::SimClient;
pub use config::SimConfig;
pub use transport::{SimControl, SimTransport};

pub(crate) use stream::SimStream;
