//! Outstanding-work tracking for the drain phase.
//!
//! Every accepted connection and every registered background routine is one
//! unit. The drain waits until the count reaches zero.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::debug;

use crate::error::{Error, Result};

/// Counter of outstanding units of work.
///
/// Clones share the same count.
#[derive(Debug, Clone, Default)]
pub struct ActivityTracker {
    inner: Arc<TrackerInner>,
}

#[derive(Debug, Default)]
struct TrackerInner {
    /// Outstanding units.
    count: AtomicUsize,

    /// Notified when the count drops to zero.
    drained: Notify,
}

impl ActivityTracker {
    /// Create a tracker with no outstanding units.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one unit of work.
    pub fn start_unit(&self) {
        self.inner.count.fetch_add(1, Ordering::SeqCst);
    }

    /// Release one unit of work.
    ///
    /// # Panics
    ///
    /// Panics if no unit is outstanding. An unpaired finish is a caller bug
    /// and would otherwise let a drain complete while work is still running.
    pub fn finish_unit(&self) {
        let prev = self
            .inner
            .count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .unwrap_or_else(|_| {
                panic!("finish_unit called with no outstanding units (unpaired start/finish)")
            });

        if prev == 1 {
            self.inner.drained.notify_waiters();
        }
    }

    /// Register one unit and return a guard that releases it on drop.
    pub fn unit(&self) -> UnitGuard {
        self.start_unit();
        UnitGuard {
            tracker: self.clone(),
        }
    }

    /// Number of outstanding units.
    pub fn active(&self) -> usize {
        self.inner.count.load(Ordering::SeqCst)
    }

    /// Wait until no units are outstanding.
    ///
    /// There is no timeout: a unit that is never released blocks forever.
    /// Use [`wait_timeout`](Self::wait_timeout) to bound the drain.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.drained.notified();
            tokio::pin!(notified);
            // Register interest before checking, so a release between the
            // check and the await still wakes us.
            notified.as_mut().enable();

            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Wait until no units are outstanding, or until `limit` elapses.
    ///
    /// Returns [`Error::DrainTimedOut`] with the remaining count on expiry.
    pub async fn wait_timeout(&self, limit: Duration) -> Result<()> {
        match tokio::time::timeout(limit, self.wait()).await {
            Ok(()) => Ok(()),
            Err(_) => {
                let remaining = self.active();
                debug!(remaining, timeout_ms = limit.as_millis() as u64, "Drain deadline expired");
                Err(Error::DrainTimedOut { remaining })
            }
        }
    }
}

/// A registered unit of work, released when dropped.
///
/// Dropping during a panic unwind also releases the unit.
#[derive(Debug)]
#[must_use = "the unit is released as soon as the guard is dropped"]
pub struct UnitGuard {
    tracker: ActivityTracker,
}

impl Drop for UnitGuard {
    fn drop(&mut self) {
        self.tracker.finish_unit();
    }
}
