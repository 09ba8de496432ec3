//! Connection decorators applied to every tunneled stream.
//!
//! Order, innermost first:
//!
//! ```text
//! ChannelStream → IdleTimeout → ByteCounter → ConnTracker
//! ```

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Instant, Sleep};

use super::TrafficCounters;

// ---------------------------------------------------------------------------
// IdleTimeout
// ---------------------------------------------------------------------------

/// Fails reads and writes with `TimedOut` once no I/O has completed for
/// `idle`.
pub struct IdleTimeout<S> {
    // ---
    inner: S,
    idle: Duration,
    deadline: Pin<Box<Sleep>>,
}

// ---

impl<S> IdleTimeout<S> {
    // ---
    pub fn new(inner: S, idle: Duration) -> Self {
        // ---
        Self {
            inner,
            idle,
            deadline: Box::pin(tokio::time::sleep(idle)),
        }
    }

    // ---

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    // ---

    fn touch(&mut self) {
        let next = Instant::now() + self.idle;
        self.deadline.as_mut().reset(next);
    }

    // ---

    fn poll_expired(&mut self, cx: &mut Context<'_>) -> Poll<io::Error> {
        // ---
        match self.deadline.as_mut().poll(cx) {
            Poll::Ready(()) => Poll::Ready(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("idle for {:?}", self.idle),
            )),
            Poll::Pending => Poll::Pending,
        }
    }
}

// ---

impl<S: AsyncRead + Unpin> AsyncRead for IdleTimeout<S> {
    // ---
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        // ---
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(res) => {
                this.touch();
                Poll::Ready(res)
            }
            Poll::Pending => this.poll_expired(cx).map(Err),
        }
    }
}

// ---

impl<S: AsyncWrite + Unpin> AsyncWrite for IdleTimeout<S> {
    // ---
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        // ---
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_write(cx, data) {
            Poll::Ready(res) => {
                this.touch();
                Poll::Ready(res)
            }
            Poll::Pending => this.poll_expired(cx).map(Err),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

// ---------------------------------------------------------------------------
// ByteCounter
// ---------------------------------------------------------------------------

/// Adds every byte read or written to [`TrafficCounters`].
pub struct ByteCounter<S> {
    // ---
    inner: S,
    counters: Arc<TrafficCounters>,
}

// ---

impl<S> ByteCounter<S> {
    // ---
    pub fn new(inner: S, counters: Arc<TrafficCounters>) -> Self {
        Self { inner, counters }
    }

    // ---

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

// ---

impl<S: AsyncRead + Unpin> AsyncRead for ByteCounter<S> {
    // ---
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        // ---
        let before = buf.filled().len();
        let res = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = res {
            self.counters.add_bytes((buf.filled().len() - before) as u64);
        }
        res
    }
}

// ---

impl<S: AsyncWrite + Unpin> AsyncWrite for ByteCounter<S> {
    // ---
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        // ---
        let res = Pin::new(&mut self.inner).poll_write(cx, data);
        if let Poll::Ready(Ok(n)) = res {
            self.counters.add_bytes(n as u64);
        }
        res
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

// ---------------------------------------------------------------------------
// ConnTracker
// ---------------------------------------------------------------------------

/// Holds one unit of the open-connection gauge until dropped.
pub struct ConnTracker<S> {
    // ---
    inner: S,
    counters: Arc<TrafficCounters>,
}

// ---

impl<S> ConnTracker<S> {
    // ---
    pub fn new(inner: S, counters: Arc<TrafficCounters>) -> Self {
        // ---
        counters.conn_opened();
        Self { inner, counters }
    }

    // ---

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

// ---

impl<S> Drop for ConnTracker<S> {
    fn drop(&mut self) {
        self.counters.conn_closed();
    }
}

// ---

impl<S: AsyncRead + Unpin> AsyncRead for ConnTracker<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

// ---

impl<S: AsyncWrite + Unpin> AsyncWrite for ConnTracker<S> {
    // ---
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
