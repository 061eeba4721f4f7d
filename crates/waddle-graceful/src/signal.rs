//! Shutdown trigger and the background waiter that acts on it.
//!
//! Each [`GracefulServer`](crate::GracefulServer) owns its own
//! [`ShutdownSignal`], so several servers in one process shut down
//! independently. The hosting application fires the trigger through a
//! [`ShutdownHandle`], either directly or from OS signals via
//! [`ShutdownHandle::trigger_on_os_signal`].

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Action run by the waiter when shutdown is triggered.
type ShutdownAction = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// OS signal that requested shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsSignal {
    /// SIGTERM
    Terminate,
    /// SIGINT / Ctrl+C
    Interrupt,
}

/// Single-use shutdown trigger with one registered action.
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<SignalInner>,
}

#[derive(Default)]
struct SignalInner {
    trigger: CancellationToken,

    /// Last writer wins.
    action: Mutex<Option<ShutdownAction>>,
}

impl std::fmt::Debug for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownSignal")
            .field("triggered", &self.is_triggered())
            .field("armed", &self.is_armed())
            .finish()
    }
}

impl ShutdownSignal {
    /// Create an untriggered signal with no action.
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for the hosting application to fire the trigger.
    pub fn handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            trigger: self.inner.trigger.clone(),
        }
    }

    /// Fire the trigger. Later calls have no effect.
    pub fn trigger(&self) {
        self.inner.trigger.cancel();
    }

    /// Whether the trigger has fired.
    pub fn is_triggered(&self) -> bool {
        self.inner.trigger.is_cancelled()
    }

    /// Wait until the trigger fires.
    pub async fn triggered(&self) {
        self.inner.trigger.cancelled().await;
    }

    /// Whether an action is registered and has not run yet.
    pub fn is_armed(&self) -> bool {
        self.inner
            .action
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Register the action to run on shutdown, replacing any previous one.
    ///
    /// There is no fan-out: only the most recently registered action runs.
    pub fn register<F, Fut>(&self, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let action: ShutdownAction = Box::new(move || action().boxed());
        let previous = self
            .inner
            .action
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(action);

        if previous.is_some() {
            warn!("Replacing previously registered shutdown action; only the latest will run");
        } else {
            debug!("Shutdown action registered");
        }
    }

    /// Drop the registered action without running it.
    pub(crate) fn disarm(&self) {
        self.inner
            .action
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Spawn the waiter task.
    ///
    /// The task waits for the trigger, runs the registered action once and
    /// exits. If nothing is registered by then, it logs and exits.
    pub fn spawn_waiter(&self) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.trigger.cancelled().await;

            let action = inner
                .action
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();

            match action {
                Some(action) => {
                    info!("Shutdown triggered, running shutdown action");
                    action().await;
                }
                None => {
                    warn!("Shutdown triggered but no shutdown action is registered");
                }
            }
        })
    }
}

/// Clonable trigger surface for the hosting application.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    trigger: CancellationToken,
}

impl ShutdownHandle {
    /// Request graceful shutdown. Later calls have no effect.
    pub fn shutdown(&self) {
        self.trigger.cancel();
    }

    /// Whether shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        self.trigger.is_cancelled()
    }

    /// Wait until shutdown has been requested.
    pub async fn wait(&self) {
        self.trigger.cancelled().await;
    }

    /// Wait for SIGTERM or SIGINT, then request shutdown.
    ///
    /// Returns an error if the signal handlers cannot be installed.
    pub async fn trigger_on_os_signal(&self) -> std::io::Result<OsSignal> {
        let signal = wait_for_os_signal().await?;
        self.shutdown();
        Ok(signal)
    }
}

/// Wait for a shutdown signal from the OS.
///
/// On Unix this is SIGTERM or SIGINT; elsewhere Ctrl+C.
pub async fn wait_for_os_signal() -> std::io::Result<OsSignal> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
                Ok(OsSignal::Terminate)
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, initiating graceful shutdown");
                Ok(OsSignal::Interrupt)
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, initiating graceful shutdown");
        Ok(OsSignal::Interrupt)
    }
}
