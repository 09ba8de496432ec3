//! Liveness monitors for the session manager.
//!
//! Three tasks per manager, all exiting on its shutdown token:
//!
//! - keepalive ticker: probes the installed client, reconnects on error or
//!   silence, and reconnects outright when no client is installed;
//! - death watcher: waits for the client to close and reconnects;
//! - channel monitor: periodic debug log of the open count and ceiling.

use std::sync::Arc;

use tokio::time::MissedTickBehavior;

use super::SessionManager;

// ---------------------------------------------------------------------------
// spawn
// ---------------------------------------------------------------------------

pub(crate) fn spawn(sm: &Arc<SessionManager>) {
    // ---
    tokio::spawn(keepalive_loop(Arc::clone(sm)));
    tokio::spawn(death_watch_loop(Arc::clone(sm)));
    tokio::spawn(channel_monitor_loop(Arc::clone(sm)));
}

// ---------------------------------------------------------------------------
// Keepalive
// ---------------------------------------------------------------------------

async fn keepalive_loop(sm: Arc<SessionManager>) {
    // ---
    let shutdown = sm.shutdown_token();
    let timeout = sm.options().keepalive_timeout;

    let mut tick = tokio::time::interval(sm.options().keepalive_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tick.tick() => {}
        }

        let Some(client) = sm.current_client() else {
            if let Err(e) = sm.reconnect().await {
                tracing::debug!("keepalive: reconnect without client: {e}");
            }
            continue;
        };

        let res = tokio::select! {
            _ = shutdown.cancelled() => break,
            res = tokio::time::timeout(timeout, client.keepalive()) => res,
        };

        match res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!("keepalive failed: {e}");
                let _ = sm.reconnect_if_current(&client).await;
            }
            Err(_) => {
                tracing::warn!(?timeout, "keepalive unanswered");
                let _ = sm.reconnect_if_current(&client).await;
            }
        }
    }

    tracing::debug!("keepalive monitor stopped");
}

// ---------------------------------------------------------------------------
// Death watcher
// ---------------------------------------------------------------------------

async fn death_watch_loop(sm: Arc<SessionManager>) {
    // ---
    let shutdown = sm.shutdown_token();
    let poll = sm.options().death_poll;

    loop {
        let Some(client) = sm.current_client() else {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(poll) => continue,
            }
        };

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = client.wait_closed() => {}
        }

        tracing::warn!("transport lost");
        let _ = sm.reconnect_if_current(&client).await;
    }

    tracing::debug!("death watcher stopped");
}

// ---------------------------------------------------------------------------
// Channel monitor
// ---------------------------------------------------------------------------

async fn channel_monitor_loop(sm: Arc<SessionManager>) {
    // ---
    let shutdown = sm.shutdown_token();
    let mut tick = tokio::time::interval(sm.options().channel_log_interval);
    tick.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tick.tick() => {}
        }
        tracing::debug!(
            current = sm.channel_count(),
            max = sm.max_channels(),
            "ssh_channels",
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
