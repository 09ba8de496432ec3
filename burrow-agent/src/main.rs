//! Burrow agent daemon.
//!
//! Exposes local SOCKS5 and HTTP CONNECT proxies whose upstream connections
//! all ride one self-healing SSH session.
//!
//! Usage:
//!   burrow-agent --login me --server host.example --port 22 \
//!       --key ~/.ssh/id_ed25519 --socks 127.0.0.1:1080 --http 127.0.0.1:8080

use std::sync::Arc;
use std::time::Duration;

// ---

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

// ---

use burrow_domain::{Target, TunnelTransport};
use burrow_ssh::{AuthConfig, SshTransport};

// ---

mod channel_stream;
mod config;
mod conn_track;
mod dns;
mod liveness;
mod metrics;
mod probe;
mod proxy;
mod session_manager;
mod tun;

// ---

use config::Config;
use dns::DohServer;
use proxy::TunnelDialer;
use tun::TunHelper;

// Gateway re-exports; siblings import via super::Symbol
pub use channel_stream::{ChannelCounter, ChannelStream, Slot};
pub use conn_track::{ByteCounter, ConnTracker, IdleTimeout};
pub use dns::DnsResolver;
pub use metrics::TrafficCounters;
pub use probe::ProbeConfig;
pub use session_manager::{SessionError, SessionManager, SessionOptions};

/// Pause between failed bootstrap attempts.
const BOOT_RETRY: Duration = Duration::from_secs(5);

/// Time the front-ends get to wind down after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---
    let cfg = Config::parse();
    init_tracing(cfg.debug);
    cfg.validate()?;

    info!(version = env!("CARGO_PKG_VERSION"), "burrow-agent starting");

    let servers = cfg
        .dns_servers
        .iter()
        .map(|url| DohServer::parse(url))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let boot_resolver = DnsResolver::new(servers, cfg.dns_v6)?;

    // validate() guarantees these.
    let (Some(login), Some(server), Some(port)) = (&cfg.login, &cfg.server, cfg.port) else {
        anyhow::bail!("missing SSH credentials");
    };

    let mut auth = AuthConfig::new(login.clone());
    if let Some(key) = &cfg.key {
        auth = auth.with_key_path(key);
    }
    if let Some(password) = &cfg.password {
        auth = auth.with_password(password.clone());
    }
    let transport: Arc<dyn TunnelTransport> = Arc::new(SshTransport::new(auth));

    let opts = SessionOptions {
        max_channels_override: cfg.max_channels,
        ..SessionOptions::default()
    };

    let sm = tokio::select! {
        sm = bootstrap(&boot_resolver, server, port, transport, opts) => sm,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted before the session came up");
            return Ok(());
        }
    };

    // Front-ends and monitors.
    let shutdown = CancellationToken::new();
    let counters = TrafficCounters::new();
    let period = Duration::from_secs(cfg.monitor_interval_sec);
    let monitors = metrics::spawn_monitors(Arc::clone(&counters), period, shutdown.clone());

    let dialer = Arc::new(TunnelDialer::new(
        Arc::clone(&sm),
        counters,
        cfg.dns_v6,
        shutdown.clone(),
    ));
    let resolver = Arc::new(boot_resolver.tunneled(Arc::clone(&dialer)));

    let mut servers = JoinSet::new();

    if let Some(addr) = cfg.socks {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding SOCKS5 listener on {addr}"))?;
        servers.spawn(proxy::socks::serve(
            listener,
            Arc::clone(&dialer),
            Arc::clone(&resolver),
            shutdown.clone(),
        ));
    }

    if let Some(addr) = cfg.http {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding HTTP listener on {addr}"))?;
        servers.spawn(proxy::http::serve(listener, Arc::clone(&dialer), shutdown.clone()));
    }

    let tun = match (&cfg.tun_bin, cfg.socks) {
        (Some(bin), Some(socks)) if cfg.tun => Some(TunHelper::spawn(bin, socks).await?),
        _ => None,
    };

    wait_for_signal().await?;
    info!("shutting down");

    shutdown.cancel();
    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while servers.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        tracing::warn!(grace = ?SHUTDOWN_GRACE, "front-ends still running; aborting");
        servers.abort_all();
    }
    monitors.abort();

    if let Some(tun) = tun {
        tun.kill().await;
    }
    sm.close().await;

    info!("bye");
    Ok(())
}

// ---------------------------------------------------------------------------
// Startup
// ---------------------------------------------------------------------------

/// Resolve the server and bring the session up, retrying until it works.
async fn bootstrap(
    resolver: &DnsResolver,
    server: &str,
    port: u16,
    transport: Arc<dyn TunnelTransport>,
    opts: SessionOptions,
) -> Arc<SessionManager> {
    // ---
    loop {
        let attempt = async {
            let ip = resolver
                .resolve_boot(server)
                .await
                .with_context(|| format!("resolving {server}"))?;
            let remote = Target::new(ip.to_string(), port);
            let sm = SessionManager::connect(remote, Arc::clone(&transport), opts.clone()).await?;
            anyhow::Ok(sm)
        };

        match attempt.await {
            Ok(sm) => return sm,
            Err(e) => {
                tracing::error!(retry_in = ?BOOT_RETRY, "session bootstrap failed: {e:#}");
                tokio::time::sleep(BOOT_RETRY).await;
            }
        }
    }
}

// ---

fn init_tracing(debug: bool) {
    // ---
    let no_color = std::env::var("EMACS").is_ok()
        || std::env::var("NO_COLOR").is_ok()
        || std::env::var("CARGO_TERM_COLOR").as_deref() == Ok("never")
        || !std::io::IsTerminal::is_terminal(&std::io::stdout());

    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(!no_color)
        .init();
}

// ---

async fn wait_for_signal() -> anyhow::Result<()> {
    // ---
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = term.recv() => {}
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok(())
    }
}
