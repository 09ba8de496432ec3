use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

// ---

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use uuid::Uuid;

// ---

use burrow_domain::TunnelStream;

// ---------------------------------------------------------------------------
// OpenGuard
// ---------------------------------------------------------------------------

/// Holds one unit of the owning client's open-channel count.
///
/// Decrements on drop so the simulated remote frees the channel exactly
/// when the near end goes away.
pub(crate) struct OpenGuard {
    // ---
    open: Arc<AtomicUsize>,
}

// ---

impl OpenGuard {
    // ---
    pub(crate) fn new(open: Arc<AtomicUsize>) -> Self {
        Self { open }
    }
}

// ---

impl Drop for OpenGuard {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::AcqRel);
    }
}

// ---------------------------------------------------------------------------
// SimStream
// ---------------------------------------------------------------------------

/// One end of an in-process stream backed by mpsc channels.
///
/// Created in connected pairs by [`SimStream::pair`]. The write side sends
/// `Vec<u8>` chunks; the read side receives them. An empty chunk signals
/// EOF (the simulated equivalent of an SSH channel EOF). When the peer end
/// is dropped, reads return EOF and writes fail with `BrokenPipe`.
pub(crate) struct SimStream {
    // ---
    id: Uuid,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    /// Leftover bytes from a partially consumed chunk.
    read_buf: Vec<u8>,
    finished: bool,
    /// `Some` on the near end only.
    _guard: Option<OpenGuard>,
}

// ---

impl SimStream {
    // ---
    /// Create a connected `(near, far)` pair sharing one stream id.
    pub(crate) fn pair(guard: OpenGuard) -> (Self, Self) {
        // ---
        let id = Uuid::new_v4();
        let (near_tx, far_rx) = mpsc::unbounded_channel();
        let (far_tx, near_rx) = mpsc::unbounded_channel();

        let near = SimStream {
            id,
            tx: near_tx,
            rx: near_rx,
            read_buf: Vec::new(),
            finished: false,
            _guard: Some(guard),
        };
        let far = SimStream {
            id,
            tx: far_tx,
            rx: far_rx,
            read_buf: Vec::new(),
            finished: false,
            _guard: None,
        };
        (near, far)
    }
}

// ---

impl TunnelStream for SimStream {
    fn stream_id(&self) -> Uuid {
        self.id
    }
}

// ---

impl AsyncRead for SimStream {
    // ---
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        // ---
        if !self.read_buf.is_empty() {
            let n = buf.remaining().min(self.read_buf.len());
            buf.put_slice(&self.read_buf[..n]);
            self.read_buf.drain(..n);
            return Poll::Ready(Ok(()));
        }

        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) if chunk.is_empty() => Poll::Ready(Ok(())),
            Poll::Ready(Some(chunk)) => {
                let n = buf.remaining().min(chunk.len());
                buf.put_slice(&chunk[..n]);
                if n < chunk.len() {
                    self.read_buf.extend_from_slice(&chunk[n..]);
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

// ---

impl AsyncWrite for SimStream {
    // ---
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        // ---
        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }
        match self.tx.send(data.to_vec()) {
            Ok(()) => Poll::Ready(Ok(data.len())),
            Err(_) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "simulated channel closed",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // ---
        if !self.finished {
            self.finished = true;
            let _ = self.tx.send(vec![]);
        }
        Poll::Ready(Ok(()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::{OpenGuard, SimStream};

    // ---

    #[tokio::test]
    async fn pair_carries_bytes_and_eof() {
        // ---
        let open = Arc::new(AtomicUsize::new(1));
        let (mut near, mut far) = SimStream::pair(OpenGuard::new(Arc::clone(&open)));

        near.write_all(b"ping").await.unwrap();
        near.shutdown().await.unwrap();

        let mut got = Vec::new();
        far.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"ping");
    }

    // ---

    /// Dropping the near end releases its open-channel unit; dropping the
    /// far end surfaces as EOF on read and `BrokenPipe` on write.
    #[tokio::test]
    async fn drop_releases_guard_and_breaks_peer() {
        // ---
        let open = Arc::new(AtomicUsize::new(1));
        let (mut near, far) = SimStream::pair(OpenGuard::new(Arc::clone(&open)));

        drop(far);
        let mut buf = [0u8; 8];
        assert_eq!(near.read(&mut buf).await.unwrap(), 0);
        let err = near.write_all(b"x").await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);

        drop(near);
        assert_eq!(open.load(Ordering::Acquire), 0);
    }
}
