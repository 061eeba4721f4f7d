//! Accepted connections that hold a drain unit.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::tracker::UnitGuard;

/// A connection accepted by a [`GracefulListener`](crate::GracefulListener).
///
/// Holds one unit of work from the moment it is accepted until it is closed
/// or dropped, whichever comes first. Reads and writes pass straight through.
#[derive(Debug)]
pub struct GracefulConnection<S> {
    stream: S,
    unit: Option<UnitGuard>,
}

impl<S> GracefulConnection<S> {
    pub(crate) fn new(stream: S, unit: UnitGuard) -> Self {
        Self {
            stream,
            unit: Some(unit),
        }
    }

    /// Borrow the underlying stream.
    pub fn stream(&self) -> &S {
        &self.stream
    }

    /// Mutably borrow the underlying stream.
    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }
}

impl<S: AsyncWrite + Unpin> GracefulConnection<S> {
    /// Shut down and drop the stream, then release this connection's unit.
    ///
    /// The unit is released even when the shutdown fails; the error is
    /// still returned to the caller.
    pub async fn close(self) -> io::Result<()> {
        let Self { mut stream, unit } = self;
        let result = stream.shutdown().await;
        drop(stream);
        drop(unit);
        result
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for GracefulConnection<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for GracefulConnection<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.stream.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}
