//! Graceful server: binds, serves, and returns cleanly on shutdown.
//!
//! The accept loop hands every connection to a [`Handler`] in its own task.
//! When the server's shutdown trigger fires, the listener is closed, the
//! loop drains outstanding units and `serve` returns `Ok(())`.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, Instrument};

use crate::config::GracefulConfig;
use crate::connection::GracefulConnection;
use crate::error::{Error, Result};
use crate::listener::{GracefulListener, Listener};
use crate::signal::{ShutdownHandle, ShutdownSignal};
use crate::tracker::{ActivityTracker, UnitGuard};

/// Per-connection handler.
///
/// The handler owns the protocol. It should close the connection when done;
/// dropping it also releases the connection's unit.
pub trait Handler<Io, Addr>: Send + Sync + 'static {
    /// Serve one accepted connection.
    fn handle(
        &self,
        conn: GracefulConnection<Io>,
        peer: Addr,
    ) -> impl Future<Output = ()> + Send;
}

impl<F, Fut, Io, Addr> Handler<Io, Addr> for F
where
    F: Fn(GracefulConnection<Io>, Addr) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn handle(
        &self,
        conn: GracefulConnection<Io>,
        peer: Addr,
    ) -> impl Future<Output = ()> + Send {
        self(conn, peer)
    }
}

/// A server that drains in-flight work before returning from `serve`.
///
/// Each server owns its own tracker and shutdown trigger, so several servers
/// in one process shut down independently.
pub struct GracefulServer<H> {
    config: GracefulConfig,
    handler: Arc<H>,
    tracker: ActivityTracker,
    shutdown: ShutdownSignal,
}

impl<H> std::fmt::Debug for GracefulServer<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GracefulServer")
            .field("config", &self.config)
            .field("tracker", &self.tracker)
            .field("shutdown", &self.shutdown)
            .finish_non_exhaustive()
    }
}

impl<H> GracefulServer<H> {
    /// Create a server from a plain configuration and a handler.
    pub fn new(config: GracefulConfig, handler: H) -> Self {
        Self {
            config,
            handler: Arc::new(handler),
            tracker: ActivityTracker::new(),
            shutdown: ShutdownSignal::new(),
        }
    }

    /// The server configuration.
    pub fn config(&self) -> &GracefulConfig {
        &self.config
    }

    /// Handle the hosting application uses to request shutdown.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.handle()
    }

    /// Outstanding units: open connections plus running routines.
    pub fn active_units(&self) -> usize {
        self.tracker.active()
    }

    /// Register background work the drain must wait for.
    ///
    /// Must be paired with exactly one [`finish_routine`](Self::finish_routine).
    pub fn start_routine(&self) {
        self.tracker.start_unit();
    }

    /// Release background work registered with
    /// [`start_routine`](Self::start_routine).
    ///
    /// # Panics
    ///
    /// Panics if there is no outstanding unit to release.
    pub fn finish_routine(&self) {
        self.tracker.finish_unit();
    }

    /// Register background work released when the returned guard drops.
    pub fn routine_guard(&self) -> UnitGuard {
        self.tracker.unit()
    }

    /// Spawn `routine` as background work the drain waits for.
    ///
    /// The unit is released however the task ends: completion, panic or abort.
    pub fn run_routine<F>(&self, routine: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let unit = self.tracker.unit();
        tokio::spawn(async move {
            let _unit = unit;
            routine.await
        })
    }

    /// Wrap a bound listener so its connections are tracked by this server.
    pub fn wrap<L: Listener>(&self, listener: L) -> Result<Arc<GracefulListener<L>>> {
        let listener = GracefulListener::new(listener, self.tracker.clone())?
            .with_drain_timeout(self.config.drain_timeout);
        Ok(Arc::new(listener))
    }

    /// Bind the configured address and serve until shutdown completes.
    pub async fn listen_and_serve(&self) -> Result<()>
    where
        H: Handler<TcpStream, SocketAddr>,
    {
        let addr = self.config.resolved_addr();
        let listener = TcpListener::bind(addr).await.map_err(|source| Error::Bind {
            addr: addr.to_string(),
            source,
        })?;

        let listener = self.wrap(listener)?;
        info!(addr = %listener.local_addr(), "Graceful server listening");

        self.serve(listener).await
    }

    /// Serve connections from a wrapped listener until shutdown completes.
    ///
    /// Arms this server's shutdown trigger to close `listener`. Returns
    /// `Ok(())` once the listener is closed and all units have drained; any
    /// other accept outcome is returned unchanged.
    pub async fn serve<L>(&self, listener: Arc<GracefulListener<L>>) -> Result<()>
    where
        L: Listener,
        H: Handler<L::Io, L::Addr>,
    {
        listener.close_on_shutdown(&self.shutdown);
        let waiter = self.shutdown.spawn_waiter();

        match accept_loop(&listener, &self.handler).await {
            Error::Shutdown => {
                info!(addr = ?listener.local_addr(), "Graceful shutdown complete");
                Ok(())
            }
            e => {
                error!(addr = ?listener.local_addr(), error = %e, "Serving stopped");
                waiter.abort();
                self.shutdown.disarm();
                Err(e)
            }
        }
    }
}

/// Accept until the listener reports an error, spawning one task per connection.
async fn accept_loop<L, H>(listener: &GracefulListener<L>, handler: &Arc<H>) -> Error
where
    L: Listener,
    H: Handler<L::Io, L::Addr>,
{
    loop {
        let (conn, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => return e,
        };

        let handler = Arc::clone(handler);
        let span = info_span!("graceful.connection", peer = ?peer);
        tokio::spawn(async move { handler.handle(conn, peer).await }.instrument(span));
    }
}

/// Bind `addr` and serve `handler` until `shutdown` resolves and all
/// connections have drained.
pub async fn listen_and_serve<H, S>(addr: impl Into<String>, handler: H, shutdown: S) -> Result<()>
where
    H: Handler<TcpStream, SocketAddr>,
    S: Future<Output = ()> + Send + 'static,
{
    let server = GracefulServer::new(GracefulConfig::new(addr), handler);
    let trigger = trigger_when(server.shutdown_handle(), shutdown);
    let result = server.listen_and_serve().await;
    trigger.abort();
    result
}

/// Serve `handler` on an already bound `listener` until `shutdown` resolves
/// and all connections have drained.
pub async fn serve<L, H, S>(listener: L, handler: H, shutdown: S) -> Result<()>
where
    L: Listener,
    H: Handler<L::Io, L::Addr>,
    S: Future<Output = ()> + Send + 'static,
{
    let server = GracefulServer::new(GracefulConfig::default(), handler);
    let listener = server.wrap(listener)?;
    let trigger = trigger_when(server.shutdown_handle(), shutdown);
    let result = server.serve(listener).await;
    trigger.abort();
    result
}

fn trigger_when<S>(handle: ShutdownHandle, shutdown: S) -> JoinHandle<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        shutdown.await;
        handle.shutdown();
    })
}
