//! Listener wrapper that gates admission and classifies shutdown.
//!
//! Accept failures are classified exactly once, here: while the listener is
//! open they are real errors; once [`GracefulListener::close`] has run they
//! are the expected result of shutdown, and the accept call drains all
//! outstanding units before returning [`Error::Shutdown`].

use std::fmt::Debug;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::GracefulConnection;
use crate::error::{Error, Result};
use crate::signal::ShutdownSignal;
use crate::tracker::ActivityTracker;

/// A bound listener that can be wrapped by [`GracefulListener`].
///
/// The listener is closed by dropping it.
pub trait Listener: Send + Sync + 'static {
    /// Stream type of accepted connections.
    type Io: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Address type of the listener and its peers.
    type Addr: Debug + Clone + Send + Sync + 'static;

    /// Accept the next connection.
    fn accept(&self) -> impl Future<Output = io::Result<(Self::Io, Self::Addr)>> + Send;

    /// Address this listener is bound to.
    fn local_addr(&self) -> io::Result<Self::Addr>;
}

impl Listener for TcpListener {
    type Io = TcpStream;
    type Addr = SocketAddr;

    fn accept(&self) -> impl Future<Output = io::Result<(Self::Io, Self::Addr)>> + Send {
        TcpListener::accept(self)
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        TcpListener::local_addr(self)
    }
}

#[cfg(unix)]
impl Listener for tokio::net::UnixListener {
    type Io = tokio::net::UnixStream;
    type Addr = tokio::net::unix::SocketAddr;

    fn accept(&self) -> impl Future<Output = io::Result<(Self::Io, Self::Addr)>> + Send {
        tokio::net::UnixListener::accept(self)
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        tokio::net::UnixListener::local_addr(self)
    }
}

/// Listener that counts every accepted connection as a unit of work and
/// drains them once closed.
pub struct GracefulListener<L: Listener> {
    /// Sole owner of the bound listener. `None` once closed.
    inner: Mutex<Option<L>>,

    /// Flips to false exactly once, on the first close.
    open: AtomicBool,

    /// Cancelled on close to wake a pending accept.
    closed: CancellationToken,

    local_addr: L::Addr,
    tracker: ActivityTracker,
    drain_timeout: Option<Duration>,
}

impl<L: Listener> Debug for GracefulListener<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GracefulListener")
            .field("local_addr", &self.local_addr)
            .field("open", &self.is_open())
            .field("active_units", &self.tracker.active())
            .field("drain_timeout", &self.drain_timeout)
            .finish()
    }
}

impl<L: Listener> GracefulListener<L> {
    /// Wrap a bound listener. Accepted connections are counted in `tracker`.
    pub fn new(listener: L, tracker: ActivityTracker) -> Result<Self> {
        let local_addr = listener.local_addr()?;
        Ok(Self {
            inner: Mutex::new(Some(listener)),
            open: AtomicBool::new(true),
            closed: CancellationToken::new(),
            local_addr,
            tracker,
            drain_timeout: None,
        })
    }

    /// Bound the drain performed by `accept` after close.
    pub fn with_drain_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Address the wrapped listener was bound to.
    pub fn local_addr(&self) -> &L::Addr {
        &self.local_addr
    }

    /// Whether the listener is still admitting connections.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Accept the next connection.
    ///
    /// - On success the connection is counted before it is returned.
    /// - If the underlying accept fails while open, the raw error is returned
    ///   as [`Error::Accept`] and nothing is drained.
    /// - Once closed, waits for all outstanding units and returns
    ///   [`Error::Shutdown`], or [`Error::DrainTimedOut`] if a drain timeout is
    ///   set and expires first.
    pub async fn accept(&self) -> Result<(GracefulConnection<L::Io>, L::Addr)> {
        let accepted = {
            let inner = self.inner.lock().await;
            match inner.as_ref() {
                Some(listener) if self.is_open() => {
                    tokio::select! {
                        biased;
                        _ = self.closed.cancelled() => None,
                        result = listener.accept() => Some(result),
                    }
                }
                _ => None,
            }
        };

        match accepted {
            Some(Ok((stream, peer))) => {
                let unit = self.tracker.unit();
                debug!(peer = ?peer, active_units = self.tracker.active(), "Accepted connection");
                Ok((GracefulConnection::new(stream, unit), peer))
            }
            Some(Err(e)) if self.is_open() => Err(Error::Accept(e)),
            Some(Err(e)) => {
                debug!(error = %e, "Accept failed after close");
                self.drain().await
            }
            None => self.drain().await,
        }
    }

    async fn drain<T>(&self) -> Result<T> {
        let active = self.tracker.active();
        info!(
            addr = ?self.local_addr,
            active_units = active,
            timeout_secs = self.drain_timeout.map(|t| t.as_secs()),
            "Listener closed, draining outstanding units"
        );

        match self.drain_timeout {
            Some(limit) => {
                if let Err(e) = self.tracker.wait_timeout(limit).await {
                    warn!(
                        remaining_units = self.tracker.active(),
                        timeout_secs = limit.as_secs(),
                        "Drain timeout expired"
                    );
                    return Err(e);
                }
            }
            None => self.tracker.wait().await,
        }

        info!(addr = ?self.local_addr, "All units drained cleanly");
        Err(Error::Shutdown)
    }

    /// Stop admitting connections and release the underlying listener.
    ///
    /// Idempotent: only the first call does anything, later calls return
    /// `Ok(())` immediately.
    pub async fn close(&self) -> Result<()> {
        if !self.open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        self.closed.cancel();
        // A pending accept releases the lock as soon as it sees the cancellation.
        let listener = self.inner.lock().await.take();
        drop(listener);

        info!(addr = ?self.local_addr, "Listener closed, no longer accepting connections");
        Ok(())
    }

    /// Register this listener's [`close`](Self::close) as the shutdown action
    /// of `signal`, replacing whatever was registered before.
    pub fn close_on_shutdown(self: &Arc<Self>, signal: &ShutdownSignal) {
        let listener = Arc::clone(self);
        signal.register(move || async move {
            if let Err(e) = listener.close().await {
                warn!(error = %e, "Failed to close listener on shutdown");
            }
        });
    }
}
