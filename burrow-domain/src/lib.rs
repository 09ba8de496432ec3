//! Core traits and types for the burrow tunneling proxy.
//!
//! This crate defines the vocabulary of the system. The agent, the SSH
//! transport and the link simulator all depend on `burrow-domain` and speak
//! its types. No implementations live here.
//!
//! # Structure
//!
//! - [`error`]: [`TunnelError`] and [`Result<T>`] alias
//! - [`target`]: [`Target`], a parsed `host:port` destination
//! - [`transport`]: [`TunnelStream`], [`TransportClient`], [`TunnelTransport`] traits

mod error;
mod target;
mod transport;

// --- error
pub use error::{Result, TunnelError};

// --- target
pub use target::Target;

// --- transport
pub use transport::{
    // ---
    TransportClient,
    TransportClientPtr,
    TunnelStream,
    TunnelStreamPtr,
    TunnelTransport,
};
