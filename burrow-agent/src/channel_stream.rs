//! [`ChannelStream`]: a transport stream bound to one admission slot.
//!
//! Every stream the session manager hands out is wrapped here. The slot is
//! released exactly once, by [`ChannelStream::close`] or on drop, whichever
//! comes first.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use uuid::Uuid;

use burrow_domain::{TunnelStream, TunnelStreamPtr};

// ---------------------------------------------------------------------------
// ChannelCounter
// ---------------------------------------------------------------------------

/// Open-channel count for one connection epoch.
///
/// A reconnect installs a fresh counter; slots taken before it release into
/// the retired one, so the live count starts from zero and cannot be driven
/// negative by stragglers.
#[derive(Debug, Default)]
pub struct ChannelCounter {
    // ---
    open: AtomicI64,
}

// ---

impl ChannelCounter {
    // ---
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    // ---

    pub fn get(&self) -> i64 {
        self.open.load(Ordering::Acquire)
    }

    // ---

    /// Take one unit if the count is below `max`. `max == 0` means no ceiling.
    pub(crate) fn try_reserve(&self, max: u32) -> bool {
        // ---
        let max = i64::from(max);
        self.open
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                (max == 0 || c < max).then_some(c + 1)
            })
            .is_ok()
    }

    // ---

    /// Give one unit back. Never goes below zero.
    fn release(&self) {
        // ---
        let res = self
            .open
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                (c > 0).then_some(c - 1)
            });
        if res.is_err() {
            tracing::warn!("channel counter release at zero ignored");
        }
    }
}

// ---------------------------------------------------------------------------
// Slot
// ---------------------------------------------------------------------------

/// RAII reservation of one admission unit against one epoch's counter.
#[derive(Debug)]
pub struct Slot {
    // ---
    counter: Arc<ChannelCounter>,
    released: AtomicBool,
}

// ---

impl Slot {
    // ---
    /// Caller must already have reserved a unit on `counter`.
    pub(crate) fn reserved(counter: Arc<ChannelCounter>) -> Self {
        Self {
            counter,
            released: AtomicBool::new(false),
        }
    }

    // ---

    /// `true` if this slot was taken against `counter`.
    pub(crate) fn belongs_to(&self, counter: &Arc<ChannelCounter>) -> bool {
        Arc::ptr_eq(&self.counter, counter)
    }

    // ---

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    // ---

    /// Idempotent.
    pub fn release(&self) {
        // ---
        if !self.released.swap(true, Ordering::AcqRel) {
            self.counter.release();
        }
    }
}

// ---

impl Drop for Slot {
    fn drop(&mut self) {
        self.release();
    }
}

// ---------------------------------------------------------------------------
// ChannelStream
// ---------------------------------------------------------------------------

pub struct ChannelStream {
    // ---
    inner: TunnelStreamPtr,
    slot: Slot,
}

// ---

impl ChannelStream {
    // ---
    pub(crate) fn new(inner: TunnelStreamPtr, slot: Slot) -> Self {
        Self { inner, slot }
    }

    // ---

    /// Release the slot, then shut the inner stream down. Safe to call more
    /// than once; only the first call touches the counter.
    pub async fn close(&mut self) -> io::Result<()> {
        // ---
        self.slot.release();
        self.inner.shutdown().await
    }

    // ---

    pub fn is_closed(&self) -> bool {
        self.slot.is_released()
    }
}

// ---

impl TunnelStream for ChannelStream {
    fn stream_id(&self) -> Uuid {
        self.inner.stream_id()
    }
}

// ---

impl AsyncRead for ChannelStream {
    // ---
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.inner).poll_read(cx, buf)
    }
}

// ---

impl AsyncWrite for ChannelStream {
    // ---
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut *self.inner).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.inner).poll_flush(cx)
    }

    /// Half-close only. The slot stays held until close or drop, since the
    /// other direction may still be carrying data.
    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.inner).poll_shutdown(cx)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
