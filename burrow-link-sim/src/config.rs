use std::time::Duration;

// ---------------------------------------------------------------------------
// SimConfig
// ---------------------------------------------------------------------------

/// Configuration for the in-process simulated transport.
///
/// Defaults describe an unconstrained remote: any number of channels, and
/// every stream echoes what it receives.
#[derive(Debug, Clone)]
pub struct SimConfig {
    // ---
    /// Concurrent channels the simulated remote grants per client before
    /// refusing with a resource-shortage error. `None` = unlimited.
    pub channel_limit: Option<usize>,

    /// When `true` the remote end of every stream echoes bytes back.
    /// When `false` the remote end just holds the stream open and discards.
    pub echo: bool,

    /// Delay before each `open_stream` answers, on the tokio clock.
    pub open_latency: Duration,
}

// ---

impl Default for SimConfig {
    fn default() -> Self {
        // ---
        Self {
            channel_limit: None,
            echo: true,
            open_latency: Duration::ZERO,
        }
    }
}

// ---

impl SimConfig {
    // ---
    /// No channel limit. Useful as a baseline.
    pub fn unlimited() -> Self {
        Self::default()
    }

    // ---

    /// Remote that refuses the `limit + 1`-th concurrent channel.
    pub fn limited(limit: usize) -> Self {
        // ---
        Self {
            channel_limit: Some(limit),
            ..Default::default()
        }
    }
}
