//! CLI configuration for `burrow-agent`.
//!
//! Every flag can also come from the environment:
//!   LOGIN=me SERVER=host.example PORT=22 SSH_KEY=~/.ssh/id_ed25519 \
//!   SOCKS_LSN=127.0.0.1:1080 burrow-agent

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::bail;
use clap::builder::FalseyValueParser;
use clap::Parser;

pub const DEFAULT_DNS_SERVERS: &str = "https://1.1.1.1/dns-query,https://8.8.8.8/resolve";

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Parser)]
#[command(name = "burrow-agent", about = "SOCKS5 / HTTP CONNECT proxy over one SSH session")]
pub struct Config {
    // ---
    /// SSH user name.
    #[arg(long, env = "LOGIN")]
    pub login: Option<String>,

    /// SSH password. Tried after the key when both are given.
    #[arg(long, env = "PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// SSH server host name or IP.
    #[arg(long, env = "SERVER")]
    pub server: Option<String>,

    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Private key path; `~/` is expanded.
    #[arg(long, env = "SSH_KEY")]
    pub key: Option<String>,

    /// SOCKS5 listen address, e.g. 127.0.0.1:1080.
    #[arg(long, env = "SOCKS_LSN")]
    pub socks: Option<SocketAddr>,

    /// HTTP CONNECT listen address, e.g. 127.0.0.1:8080.
    #[arg(long, env = "HTTP_LSN")]
    pub http: Option<SocketAddr>,

    /// Route the whole host through the SOCKS listener with a tun2socks helper.
    #[arg(long, env = "USE_TUN", value_parser = FalseyValueParser::new())]
    pub tun: bool,

    /// Path to the tun2socks binary.
    #[arg(long, env = "TUN_BIN")]
    pub tun_bin: Option<PathBuf>,

    /// Period of the traffic and connection-count logs, in seconds.
    #[arg(long, env = "TIME_OUT_MONITOR_INT_SEC", default_value_t = 60)]
    pub monitor_interval_sec: u64,

    #[arg(long, env = "DEBUG", value_parser = FalseyValueParser::new())]
    pub debug: bool,

    /// DNS-over-HTTPS JSON endpoints, tried in order.
    #[arg(
        long,
        env = "DNS_SERVERS",
        value_delimiter = ',',
        default_value = DEFAULT_DNS_SERVERS
    )]
    pub dns_servers: Vec<String>,

    /// Allow IPv6 targets and AAAA lookups.
    #[arg(long, env = "DNS_V6", value_parser = FalseyValueParser::new())]
    pub dns_v6: bool,

    /// Fixed channel ceiling. Skips the capacity probe when set.
    #[arg(long, env = "MAX_CHANNELS")]
    pub max_channels: Option<u32>,
}

// ---

impl Config {
    // ---
    /// Check the cross-field rules clap cannot express.
    pub fn validate(&self) -> anyhow::Result<()> {
        // ---
        if self.login.is_none() || self.server.is_none() || self.port.is_none() {
            bail!("LOGIN, SERVER and PORT are required");
        }
        if self.password.is_none() && self.key.is_none() {
            bail!("one of PASSWORD or SSH_KEY is required");
        }
        if self.socks.is_none() && self.http.is_none() {
            bail!("at least one of SOCKS_LSN or HTTP_LSN is required");
        }
        if self.tun {
            if self.tun_bin.is_none() {
                bail!("USE_TUN needs TUN_BIN");
            }
            if self.socks.is_none() {
                bail!("USE_TUN needs SOCKS_LSN");
            }
        }
        if self.monitor_interval_sec == 0 {
            bail!("TIME_OUT_MONITOR_INT_SEC must be positive");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
