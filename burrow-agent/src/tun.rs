//! External tun2socks helper.
//!
//! Writes a YAML config pointing the helper at our SOCKS5 listener and runs
//! it as a child process. The helper owns the TUN device and the routes.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;

// ---

use anyhow::Context;
use tokio::process::{Child, Command};

// ---------------------------------------------------------------------------
// Config template
// ---------------------------------------------------------------------------

/// Helper config. Two /1 routes cover the whole IPv4 space without
/// replacing the default route.
pub fn render_config(device: &str, socks: SocketAddr) -> String {
    // ---
    format!(
        "device: {device}\n\
         proxy: socks5://{socks}\n\
         ifconfig:\n\
         \x20 - 10.0.0.2/30\n\
         \x20 - 10.0.0.1\n\
         route:\n\
         \x20 - 0.0.0.0/1\n\
         \x20 - 128.0.0.0/1\n\
         loglevel: info\n"
    )
}

// ---

pub fn default_device() -> &'static str {
    // ---
    if cfg!(target_os = "windows") {
        "wintun://auto"
    } else if cfg!(target_os = "macos") {
        "utun"
    } else {
        "tun"
    }
}

// ---------------------------------------------------------------------------
// TunHelper
// ---------------------------------------------------------------------------

pub struct TunHelper {
    // ---
    child: Child,
    config_path: PathBuf,
}

// ---

impl TunHelper {
    // ---
    pub async fn spawn(bin: &Path, socks: SocketAddr) -> anyhow::Result<Self> {
        // ---
        let config_path =
            std::env::temp_dir().join(format!("burrow-t2s-{}.yaml", uuid::Uuid::new_v4()));
        tokio::fs::write(&config_path, render_config(default_device(), socks))
            .await
            .with_context(|| format!("writing {}", config_path.display()))?;

        let child = Command::new(bin)
            .arg("-config")
            .arg(&config_path)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("starting {}", bin.display()))?;

        tracing::info!(bin = %bin.display(), pid = ?child.id(), %socks, "tun helper started");
        Ok(Self { child, config_path })
    }

    // ---

    /// Stop the helper and remove its config file.
    pub async fn kill(mut self) {
        // ---
        if let Err(e) = self.child.kill().await {
            tracing::warn!("tun helper kill: {e}");
        }
        if let Err(e) = tokio::fs::remove_file(&self.config_path).await {
            tracing::debug!(path = %self.config_path.display(), "config cleanup: {e}");
        }
        tracing::info!("tun helper stopped");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
