//! [`SessionManager`]: owns the transport client and hands out streams.
//!
//! # Link and epochs
//!
//! The current client and the channel counter of its epoch sit together
//! behind one `std::sync::RwLock`. Readers take an `Arc` snapshot and drop
//! the guard before any `.await`. Only the reconnect routine (and `close`)
//! writes. Every successful reconnect installs a fresh [`ChannelCounter`],
//! which is how the open count returns to zero without ever going negative.
//!
//! # Single-flight reconnect
//!
//! `reconnecting` is claimed by compare-and-swap. The winner spawns the
//! routine body as its own task so that no caller can cancel it by giving
//! up; every caller, winner included, then parks on `reconnect_done` until
//! the flag clears and reports whether a client is installed.
//!
//! ```text
//! open_stream ──► admit (slot) ──► ensure client ──► open ──► ChannelStream
//!                                       │              │
//!                                       ▼              ▼ transport failure
//!                                   reconnect ◄── reconnect_if_current
//! ```

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

// ---

use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

// ---

use burrow_domain::{Target, TransportClientPtr, TunnelError, TunnelStream, TunnelTransport};

// ---

use super::{probe, ChannelCounter, ChannelStream, ProbeConfig, Slot};

/// Open attempts per `open_stream` call, reconnects included.
pub const OPEN_ATTEMPTS: u32 = 3;

// ---------------------------------------------------------------------------
// SessionError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SessionError {
    // ---
    #[error("connect to {remote} failed: {source}")]
    Connect {
        remote: String,
        #[source]
        source: TunnelError,
    },

    #[error("timed out waiting for a free channel slot")]
    SlotWaitTimeout,

    #[error("cancelled")]
    Cancelled,

    #[error("channel refused by remote: {0}")]
    Refused(String),

    #[error("reconnect failed")]
    ReconnectFailed,

    #[error("open failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    #[error("unsupported network {0:?}, only \"tcp\" is supported")]
    UnsupportedNetwork(String),

    #[error("invalid destination: {0}")]
    InvalidTarget(String),

    #[error("session manager closed")]
    Closed,
}

// ---------------------------------------------------------------------------
// SessionOptions
// ---------------------------------------------------------------------------

/// Timing and sizing knobs. The defaults are the production values; tests
/// shrink them.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    // ---
    /// Bound on one raw dial plus handshake.
    pub dial_timeout: Duration,

    /// Dials per reconnect routine.
    pub reconnect_attempts: u32,

    /// First backoff between failed dials; doubles after each failure.
    pub initial_backoff: Duration,

    pub admission_poll: Duration,
    pub admission_wait: Duration,

    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,

    /// Death-watcher poll period while no client is installed.
    pub death_poll: Duration,

    /// Period of the channel-count debug log.
    pub channel_log_interval: Duration,

    pub probe: ProbeConfig,

    /// Operator-pinned ceiling. Skips the probe; `Some(0)` disables the
    /// ceiling.
    pub max_channels_override: Option<u32>,
}

// ---

impl Default for SessionOptions {
    fn default() -> Self {
        // ---
        Self {
            dial_timeout: Duration::from_secs(5),
            reconnect_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            admission_poll: Duration::from_millis(20),
            admission_wait: Duration::from_secs(2),
            keepalive_interval: Duration::from_secs(1),
            keepalive_timeout: Duration::from_secs(5),
            death_poll: Duration::from_millis(200),
            channel_log_interval: Duration::from_secs(30),
            probe: ProbeConfig::default(),
            max_channels_override: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Link
// ---------------------------------------------------------------------------

/// Current client plus its epoch's counter. Swapped as a unit.
struct Link {
    // ---
    client: Option<TransportClientPtr>,
    counter: Arc<ChannelCounter>,
}

// ---------------------------------------------------------------------------
// SessionManager
// ---------------------------------------------------------------------------

pub struct SessionManager {
    // ---
    remote: Target,
    transport: Arc<dyn TunnelTransport>,
    opts: SessionOptions,

    link: RwLock<Link>,

    /// Admission ceiling. `0` = unlimited. Read without a lock.
    max_channels: AtomicU32,

    reconnecting: AtomicBool,
    reconnect_done: Notify,

    shutdown: CancellationToken,
}

// ---

impl SessionManager {
    // ---
    /// Dial `remote` once, measure its channel ceiling and start the
    /// liveness monitors. The caller owns retrying a failed first connect.
    pub async fn connect(
        remote: Target,
        transport: Arc<dyn TunnelTransport>,
        opts: SessionOptions,
    ) -> Result<Arc<Self>, SessionError> {
        // ---
        let client = dial(transport.as_ref(), &remote, opts.dial_timeout)
            .await
            .map_err(|source| SessionError::Connect {
                remote: remote.to_string(),
                source,
            })?;

        let sm = Arc::new(Self {
            remote,
            transport,
            opts,
            link: RwLock::new(Link {
                client: None,
                counter: ChannelCounter::new(),
            }),
            max_channels: AtomicU32::new(0),
            reconnecting: AtomicBool::new(false),
            reconnect_done: Notify::new(),
            shutdown: CancellationToken::new(),
        });

        sm.install(client).await;
        tracing::info!(
            remote = %sm.remote,
            max_channels = sm.max_channels(),
            "session established",
        );

        super::liveness::spawn(&sm);
        Ok(sm)
    }

    // ---

    /// Open a stream to `dest` through the tunnel.
    ///
    /// Waits for an admission slot, makes sure a client is installed, then
    /// opens. A remote refusal is returned as-is; a transport failure
    /// reconnects (if nobody already replaced the client) and retries.
    pub async fn open_stream(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        network: &str,
        dest: &Target,
    ) -> Result<ChannelStream, SessionError> {
        // ---
        if network != "tcp" {
            return Err(SessionError::UnsupportedNetwork(network.to_string()));
        }

        let mut slot = self.admit(cancel).await?;
        let mut last: Option<TunnelError> = None;

        for attempt in 1..=OPEN_ATTEMPTS {
            let (client, counter) = self.ensure_client(cancel).await?;

            // A reconnect rolled the epoch under us; re-admit on the new one.
            if !slot.belongs_to(&counter) {
                drop(slot);
                slot = self.admit(cancel).await?;
            }

            match client.open_stream(dest).await {
                Ok(stream) => {
                    tracing::trace!(%dest, stream = %stream.stream_id(), "stream opened");
                    return Ok(ChannelStream::new(stream, slot));
                }
                Err(e) if e.is_refusal() => {
                    tracing::debug!(%dest, "open refused: {e}");
                    return Err(SessionError::Refused(e.to_string()));
                }
                Err(TunnelError::InvalidTarget(t)) => {
                    return Err(SessionError::InvalidTarget(t));
                }
                Err(e) => {
                    tracing::warn!(%dest, attempt, "open failed: {e}");
                    if cancel.is_cancelled() {
                        return Err(SessionError::Cancelled);
                    }
                    // A failed reconnect is picked up by the next ensure.
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(SessionError::Cancelled),
                        _ = self.reconnect_if_current(&client) => {}
                    }
                    last = Some(e);
                }
            }
        }

        Err(SessionError::RetriesExhausted {
            attempts: OPEN_ATTEMPTS,
            last: last.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    // ---

    /// Stop the monitors and tear the client down. Idempotent.
    pub async fn close(&self) {
        // ---
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        tracing::info!(remote = %self.remote, "closing session manager");

        if let Some(client) = self.take_client() {
            if let Err(e) = client.close().await {
                tracing::debug!("close: {e}");
            }
        }
    }

    // ---

    /// Open channels in the current epoch.
    pub fn channel_count(&self) -> i64 {
        self.snapshot().1.get()
    }

    // ---

    pub fn max_channels(&self) -> u32 {
        self.max_channels.load(Ordering::Acquire)
    }

    // ---

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    // ---

    /// Token cancelled by [`close`](Self::close).
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    // ---

    pub(crate) fn options(&self) -> &SessionOptions {
        &self.opts
    }

    // ---

    /// Snapshot of the installed client.
    pub fn current_client(&self) -> Option<TransportClientPtr> {
        self.snapshot().0
    }

    // -----------------------------------------------------------------------
    // Reconnect
    // -----------------------------------------------------------------------

    /// Single-flight reconnect. Returns once the in-flight routine (started
    /// here or by someone else) finishes.
    pub async fn reconnect(self: &Arc<Self>) -> Result<(), SessionError> {
        // ---
        if self.is_closed() {
            return Err(SessionError::Closed);
        }

        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let flight = InFlight(Arc::clone(self));
            tokio::spawn(async move {
                flight.0.reconnect_body().await;
                drop(flight);
            });
        }

        self.wait_reconnect_done().await;

        if self.is_closed() {
            Err(SessionError::Closed)
        } else if self.current_client().is_some() {
            Ok(())
        } else {
            Err(SessionError::ReconnectFailed)
        }
    }

    // ---

    /// Reconnect only if `failed` is still the installed client, or none is
    /// installed. A stale report about an already-replaced client is a no-op.
    pub async fn reconnect_if_current(
        self: &Arc<Self>,
        failed: &TransportClientPtr,
    ) -> Result<(), SessionError> {
        // ---
        if let Some(current) = self.current_client() {
            if !Arc::ptr_eq(&current, failed) {
                tracing::debug!("failure report for a replaced client ignored");
                return Ok(());
            }
        }
        self.reconnect().await
    }

    // ---

    async fn reconnect_body(&self) {
        // ---
        if self.is_closed() {
            return;
        }

        if let Some(old) = self.take_client() {
            tracing::warn!(remote = %self.remote, "discarding transport client");
            if let Err(e) = old.close().await {
                tracing::debug!("closing old client: {e}");
            }
        }

        let mut backoff = self.opts.initial_backoff;
        for attempt in 1..=self.opts.reconnect_attempts {
            tracing::info!(remote = %self.remote, attempt, "reconnecting");

            match dial(self.transport.as_ref(), &self.remote, self.opts.dial_timeout).await {
                Ok(client) => {
                    if self.is_closed() {
                        let _ = client.close().await;
                        return;
                    }
                    if !self.install(client).await {
                        return;
                    }
                    tracing::info!(
                        remote = %self.remote,
                        attempt,
                        max_channels = self.max_channels(),
                        "reconnected",
                    );
                    return;
                }
                Err(e) => {
                    tracing::warn!(remote = %self.remote, attempt, "reconnect attempt failed: {e}");
                }
            }

            if attempt < self.opts.reconnect_attempts {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = backoff.saturating_mul(2);
            }
        }

        tracing::error!(
            remote = %self.remote,
            attempts = self.opts.reconnect_attempts,
            "reconnect exhausted",
        );
    }

    // ---

    async fn wait_reconnect_done(&self) {
        // ---
        loop {
            let notified = self.reconnect_done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.reconnecting.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }

    // -----------------------------------------------------------------------
    // Link helpers
    // -----------------------------------------------------------------------

    fn snapshot(&self) -> (Option<TransportClientPtr>, Arc<ChannelCounter>) {
        // ---
        let link = self.link.read().unwrap_or_else(PoisonError::into_inner);
        (link.client.clone(), Arc::clone(&link.counter))
    }

    // ---

    fn take_client(&self) -> Option<TransportClientPtr> {
        self.link
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .client
            .take()
    }

    // ---

    /// Measure `client`, then publish it with a fresh epoch counter.
    ///
    /// Returns false, with `client` closed, when the manager was closed
    /// while measuring. `close` cancels before it takes the write lock, so
    /// checking under the lock leaves no window for an orphan.
    async fn install(&self, client: TransportClientPtr) -> bool {
        // ---
        let ceiling = match self.opts.max_channels_override {
            Some(pinned) => pinned,
            None => probe::effective_ceiling(probe::probe(&client, &self.opts.probe).await),
        };

        {
            let mut link = self.link.write().unwrap_or_else(PoisonError::into_inner);
            if !self.is_closed() {
                self.max_channels.store(ceiling, Ordering::Release);
                link.client = Some(client);
                link.counter = ChannelCounter::new();
                return true;
            }
        }

        tracing::debug!(remote = %self.remote, "closed while measuring; dropping new client");
        if let Err(e) = client.close().await {
            tracing::debug!("closing unused client: {e}");
        }
        false
    }

    // -----------------------------------------------------------------------
    // open_stream helpers
    // -----------------------------------------------------------------------

    /// Poll for a free slot on the current epoch's counter.
    async fn admit(&self, cancel: &CancellationToken) -> Result<Slot, SessionError> {
        // ---
        let deadline = Instant::now() + self.opts.admission_wait;
        loop {
            if cancel.is_cancelled() {
                return Err(SessionError::Cancelled);
            }
            if self.is_closed() {
                return Err(SessionError::Closed);
            }

            let counter = self.snapshot().1;
            if counter.try_reserve(self.max_channels()) {
                return Ok(Slot::reserved(counter));
            }
            if Instant::now() >= deadline {
                tracing::debug!(
                    open = counter.get(),
                    max = self.max_channels(),
                    "no free channel slot"
                );
                return Err(SessionError::SlotWaitTimeout);
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(SessionError::Cancelled),
                _ = tokio::time::sleep(self.opts.admission_poll) => {}
            }
        }
    }

    // ---

    /// Return an installed client, reconnecting if none is.
    async fn ensure_client(
        self: &Arc<Self>,
        cancel: &CancellationToken,
    ) -> Result<(TransportClientPtr, Arc<ChannelCounter>), SessionError> {
        // ---
        for _ in 0..OPEN_ATTEMPTS {
            if let (Some(client), counter) = self.snapshot() {
                return Ok((client, counter));
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(SessionError::Cancelled),
                res = self.reconnect() => {
                    if let Err(SessionError::Closed) = res {
                        return Err(SessionError::Closed);
                    }
                }
            }
        }

        match self.snapshot() {
            (Some(client), counter) => Ok((client, counter)),
            (None, _) => Err(SessionError::ReconnectFailed),
        }
    }
}

// ---------------------------------------------------------------------------
// InFlight
// ---------------------------------------------------------------------------

/// Clears the single-flight flag and wakes waiters when the routine body
/// ends, however it ends.
struct InFlight(Arc<SessionManager>);

// ---

impl Drop for InFlight {
    fn drop(&mut self) {
        // ---
        self.0.reconnecting.store(false, Ordering::Release);
        self.0.reconnect_done.notify_waiters();
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn dial(
    transport: &dyn TunnelTransport,
    remote: &Target,
    timeout: Duration,
) -> Result<TransportClientPtr, TunnelError> {
    // ---
    match tokio::time::timeout(timeout, transport.connect(remote)).await {
        Ok(res) => res,
        Err(_) => Err(TunnelError::Timeout(format!("dial {remote} after {timeout:?}"))),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_util::sync::CancellationToken;

    use burrow_domain::{Target, TransportClient, TunnelTransport};
    use burrow_link_sim::{SimConfig, SimControl, SimTransport};

    use super::{SessionError, SessionManager, SessionOptions};

    // ---

    fn remote() -> Target {
        Target::new("sim.example", 22)
    }

    fn dest() -> Target {
        Target::new("example.com", 443)
    }

    // ---

    async fn start(config: SimConfig, opts: SessionOptions) -> (Arc<SessionManager>, SimControl) {
        // ---
        let transport = SimTransport::new(config);
        let control = transport.control();
        let transport: Arc<dyn TunnelTransport> = Arc::new(transport);
        let sm = SessionManager::connect(remote(), transport, opts).await.unwrap();
        (sm, control)
    }

    // ---

    /// Options with the liveness keepalive effectively out of the way.
    fn quiet() -> SessionOptions {
        SessionOptions {
            keepalive_interval: Duration::from_secs(3600),
            ..SessionOptions::default()
        }
    }

    // ---

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        // ---
        for _ in 0..1000 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    // ---

    #[tokio::test(start_paused = true)]
    async fn connect_probes_and_streams_echo() {
        // ---
        let (sm, _control) = start(SimConfig::limited(16), quiet()).await;
        assert_eq!(sm.max_channels(), 16);
        assert_eq!(sm.channel_count(), 0);

        let cancel = CancellationToken::new();
        let mut s = sm.open_stream(&cancel, "tcp", &dest()).await.unwrap();
        assert_eq!(sm.channel_count(), 1);

        s.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        s.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");

        s.close().await.unwrap();
        assert_eq!(sm.channel_count(), 0);
        sm.close().await;
    }

    // ---

    #[tokio::test(start_paused = true)]
    async fn initial_connect_failure_is_reported() {
        // ---
        let transport = SimTransport::new(SimConfig::unlimited());
        transport.control().fail_next_dials(1);
        let transport: Arc<dyn TunnelTransport> = Arc::new(transport);

        let err = SessionManager::connect(remote(), transport, quiet())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SessionError::Connect { .. }));
    }

    // ---

    #[tokio::test(start_paused = true)]
    async fn only_tcp_is_accepted() {
        // ---
        let (sm, _control) = start(SimConfig::unlimited(), quiet()).await;
        let err = sm
            .open_stream(&CancellationToken::new(), "udp", &dest())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SessionError::UnsupportedNetwork(_)));
        assert_eq!(sm.channel_count(), 0);
    }

    // ---

    /// Ceiling 2: the third open waits until one of the first two closes.
    #[tokio::test(start_paused = true)]
    async fn third_open_blocks_until_a_slot_frees() {
        // ---
        let opts = SessionOptions {
            max_channels_override: Some(2),
            ..quiet()
        };
        let (sm, _control) = start(SimConfig::unlimited(), opts).await;
        let cancel = CancellationToken::new();

        let mut a = sm.open_stream(&cancel, "tcp", &dest()).await.unwrap();
        let _b = sm.open_stream(&cancel, "tcp", &dest()).await.unwrap();
        assert_eq!(sm.channel_count(), 2);

        let sm2 = Arc::clone(&sm);
        let third = tokio::spawn(async move {
            sm2.open_stream(&CancellationToken::new(), "tcp", &dest()).await
        });

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!third.is_finished());
        assert_eq!(sm.channel_count(), 2);

        a.close().await.unwrap();
        let c = third.await.unwrap().unwrap();
        assert_eq!(sm.channel_count(), 2);
        drop(c);
        assert_eq!(sm.channel_count(), 1);
    }

    // ---

    #[tokio::test(start_paused = true)]
    async fn admission_times_out_after_hard_wait() {
        // ---
        let opts = SessionOptions {
            max_channels_override: Some(1),
            ..quiet()
        };
        let (sm, _control) = start(SimConfig::unlimited(), opts).await;
        let cancel = CancellationToken::new();
        let _held = sm.open_stream(&cancel, "tcp", &dest()).await.unwrap();

        let started = tokio::time::Instant::now();
        let err = sm.open_stream(&cancel, "tcp", &dest()).await.err().unwrap();
        assert!(matches!(err, SessionError::SlotWaitTimeout));
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(sm.channel_count(), 1);
    }

    // ---

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_admission_takes_no_slot() {
        // ---
        let opts = SessionOptions {
            max_channels_override: Some(1),
            ..quiet()
        };
        let (sm, _control) = start(SimConfig::unlimited(), opts).await;
        let _held = sm
            .open_stream(&CancellationToken::new(), "tcp", &dest())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let sm2 = Arc::clone(&sm);
        let c2 = cancel.clone();
        let waiter = tokio::spawn(async move { sm2.open_stream(&c2, "tcp", &dest()).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        let err = waiter.await.unwrap().err().unwrap();
        assert!(matches!(err, SessionError::Cancelled));
        assert_eq!(sm.channel_count(), 1);
    }

    // ---

    /// Concurrent opens never push the count past the ceiling, and it is
    /// back to zero once they are all closed.
    #[tokio::test(start_paused = true)]
    async fn count_stays_within_bounds_under_load() {
        // ---
        let opts = SessionOptions {
            max_channels_override: Some(5),
            admission_wait: Duration::from_secs(60),
            ..quiet()
        };
        let (sm, _control) = start(SimConfig::unlimited(), opts).await;

        let mut tasks = Vec::new();
        for _ in 0..40 {
            let sm = Arc::clone(&sm);
            tasks.push(tokio::spawn(async move {
                let mut s = sm
                    .open_stream(&CancellationToken::new(), "tcp", &dest())
                    .await
                    .unwrap();
                let n = sm.channel_count();
                assert!((1..=5).contains(&n), "count out of bounds: {n}");
                tokio::time::sleep(Duration::from_millis(30)).await;
                s.close().await.unwrap();
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(sm.channel_count(), 0);
    }

    // ---

    #[tokio::test(start_paused = true)]
    async fn refusal_is_returned_without_reconnect() {
        // ---
        let opts = SessionOptions {
            max_channels_override: Some(0),
            ..quiet()
        };
        let (sm, control) = start(SimConfig::limited(1), opts).await;
        let cancel = CancellationToken::new();

        let _a = sm.open_stream(&cancel, "tcp", &dest()).await.unwrap();
        let err = sm.open_stream(&cancel, "tcp", &dest()).await.err().unwrap();
        assert!(matches!(err, SessionError::Refused(_)));
        assert_eq!(control.dial_attempts(), 1);
        assert_eq!(sm.channel_count(), 1);
    }

    // ---

    /// Many concurrent triggers produce exactly one dial sequence.
    #[tokio::test(start_paused = true)]
    async fn concurrent_reconnects_share_one_flight() {
        // ---
        let (sm, control) = start(SimConfig::unlimited(), quiet()).await;
        assert_eq!(control.dial_attempts(), 1);

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let sm = Arc::clone(&sm);
            tasks.push(tokio::spawn(async move { sm.reconnect().await }));
        }
        for t in tasks {
            t.await.unwrap().unwrap();
        }

        assert_eq!(control.dial_attempts(), 2);
        assert_eq!(control.clients_created(), 2);
    }

    // ---

    /// Three failed dials then success: backoff 1 s, 2 s, 4 s, and the
    /// ceiling is measured again on the new client.
    #[tokio::test(start_paused = true)]
    async fn reconnect_backs_off_and_reprobes() {
        // ---
        let (sm, control) = start(SimConfig::limited(12), quiet()).await;
        let first_probe_opens = control.open_calls();

        control.fail_next_dials(3);
        sm.reconnect().await.unwrap();

        let times = control.dial_times();
        assert_eq!(times.len(), 5);
        let gaps: Vec<Duration> = times[1..].windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(
            gaps,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );

        assert_eq!(sm.max_channels(), 12);
        assert!(control.open_calls() > first_probe_opens, "probe should rerun");
        assert_eq!(sm.channel_count(), 0);
    }

    // ---

    #[tokio::test(start_paused = true)]
    async fn exhausted_reconnect_reports_failure_and_recovers_later() {
        // ---
        let (sm, control) = start(SimConfig::unlimited(), quiet()).await;

        control.fail_next_dials(5);
        let err = sm.reconnect().await.err().unwrap();
        assert!(matches!(err, SessionError::ReconnectFailed));
        assert!(sm.current_client().is_none());

        // next open drives a fresh reconnect
        let s = sm
            .open_stream(&CancellationToken::new(), "tcp", &dest())
            .await
            .unwrap();
        assert!(sm.current_client().is_some());
        drop(s);
    }

    // ---

    /// After transport death the watcher reconnects, the new epoch starts at
    /// zero, and streams from the old epoch do not drive it negative.
    #[tokio::test(start_paused = true)]
    async fn transport_death_resets_epoch() {
        // ---
        let (sm, control) = start(SimConfig::limited(8), quiet()).await;
        let cancel = CancellationToken::new();

        let old_a = sm.open_stream(&cancel, "tcp", &dest()).await.unwrap();
        let mut old_b = sm.open_stream(&cancel, "tcp", &dest()).await.unwrap();
        assert_eq!(sm.channel_count(), 2);
        let opens_before = control.open_calls();

        control.kill_latest();
        wait_until(|| control.clients_created() == 2 && sm.current_client().is_some()).await;

        assert_eq!(sm.channel_count(), 0);
        assert!(control.open_calls() > opens_before, "probe should rerun");

        let _ = old_b.close().await;
        drop(old_a);
        assert_eq!(sm.channel_count(), 0);

        let _fresh = sm.open_stream(&cancel, "tcp", &dest()).await.unwrap();
        assert_eq!(sm.channel_count(), 1);
    }

    // ---

    /// An open that fails on a dead client reconnects and succeeds on the
    /// replacement.
    #[tokio::test(start_paused = true)]
    async fn open_on_dead_client_retries_after_reconnect() {
        // ---
        let (sm, control) = start(SimConfig::unlimited(), quiet()).await;
        let old = sm.current_client().unwrap();

        old.close().await.unwrap();
        let s = sm
            .open_stream(&CancellationToken::new(), "tcp", &dest())
            .await
            .unwrap();

        let new = sm.current_client().unwrap();
        assert!(!Arc::ptr_eq(&old, &new));
        assert_eq!(control.clients_created(), 2);
        assert_eq!(sm.channel_count(), 1);
        drop(s);
    }

    // ---

    #[tokio::test(start_paused = true)]
    async fn stale_failure_report_is_ignored() {
        // ---
        let (sm, control) = start(SimConfig::unlimited(), quiet()).await;
        let old = sm.current_client().unwrap();

        sm.reconnect().await.unwrap();
        assert_eq!(control.dial_attempts(), 2);

        sm.reconnect_if_current(&old).await.unwrap();
        assert_eq!(control.dial_attempts(), 2);
    }

    // ---

    #[tokio::test(start_paused = true)]
    async fn close_is_idempotent_and_final() {
        // ---
        let (sm, control) = start(SimConfig::unlimited(), quiet()).await;
        let client = sm.current_client().unwrap();

        sm.close().await;
        sm.close().await;
        assert!(client.is_closed());
        assert!(sm.current_client().is_none());

        let err = sm.reconnect().await.err().unwrap();
        assert!(matches!(err, SessionError::Closed));
        let err = sm
            .open_stream(&CancellationToken::new(), "tcp", &dest())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SessionError::Closed));
        assert_eq!(control.dial_attempts(), 1);
    }

    // ---

    /// `close` landing while a fresh client is being measured leaves nothing
    /// installed and shuts that client down.
    #[tokio::test(start_paused = true)]
    async fn close_during_measurement_discards_new_client() {
        // ---
        let config = SimConfig {
            open_latency: Duration::from_millis(500),
            ..SimConfig::limited(4)
        };
        let (sm, control) = start(config, quiet()).await;

        let flight = {
            let sm = Arc::clone(&sm);
            tokio::spawn(async move { sm.reconnect().await })
        };
        wait_until(|| control.clients_created() == 2).await;
        let fresh = control.latest().unwrap();

        sm.close().await;
        let err = flight.await.unwrap().err().unwrap();
        assert!(matches!(err, SessionError::Closed));

        assert!(fresh.is_closed());
        assert!(sm.current_client().is_none());
    }

    // ---

    /// Cancelling an open stuck behind a slow reconnect returns promptly.
    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_reconnect_after_failed_open() {
        // ---
        let (sm, control) = start(SimConfig::unlimited(), quiet()).await;
        sm.current_client().unwrap().close().await.unwrap();
        control.fail_next_dials(5);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            trigger.cancel();
        });

        let started = tokio::time::Instant::now();
        let err = sm.open_stream(&cancel, "tcp", &dest()).await.err().unwrap();
        assert!(matches!(err, SessionError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(sm.channel_count(), 0);
    }
}
