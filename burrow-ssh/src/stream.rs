//! [`SshStream`]: one `direct-tcpip` channel implementing [`TunnelStream`].

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use russh::client::Msg;
use russh::ChannelStream;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use uuid::Uuid;

use burrow_domain::TunnelStream;

// ---------------------------------------------------------------------------
// SshStream
// ---------------------------------------------------------------------------

pub struct SshStream {
    // ---
    id: Uuid,
    inner: Pin<Box<ChannelStream<Msg>>>,
}

// ---

impl SshStream {
    // ---
    pub(crate) fn new(inner: ChannelStream<Msg>) -> Self {
        Self {
            id: Uuid::new_v4(),
            inner: Box::pin(inner),
        }
    }
}

// ---

impl TunnelStream for SshStream {
    fn stream_id(&self) -> Uuid {
        self.id
    }
}

// ---

impl AsyncRead for SshStream {
    // ---
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.inner.as_mut().poll_read(cx, buf)
    }
}

// ---

impl AsyncWrite for SshStream {
    // ---
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.inner.as_mut().poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.inner.as_mut().poll_flush(cx)
    }

    /// Sends channel EOF; the remote closes its side once it has drained.
    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.inner.as_mut().poll_shutdown(cx)
    }
}
