//! Graceful shutdown coordination for background loops.
//!
//! Tracks running worker loops and provides a mechanism to:
//! 1. Signal all loops to stop
//! 2. Wait (bounded) until they have actually exited

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Coordinates graceful shutdown of worker loops.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    /// Set once shutdown is signalled
    signalled: AtomicBool,
    /// Active worker count
    active: Mutex<usize>,
    /// Notified when the last worker exits
    all_closed: Condvar,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                signalled: AtomicBool::new(false),
                active: Mutex::new(0),
                all_closed: Condvar::new(),
            }),
        }
    }

    /// Register a worker. The returned guard must be held for the worker's
    /// lifetime.
    pub fn register(&self) -> WorkerGuard {
        *self.inner.active.lock() += 1;
        WorkerGuard {
            inner: self.inner.clone(),
        }
    }

    /// Signal all workers to shut down.
    pub fn shutdown(&self) {
        self.inner.signalled.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.signalled.load(Ordering::SeqCst)
    }

    /// Wait until every worker has exited or `timeout` passes.
    /// Returns true if all workers exited.
    pub fn wait_for_all_closed(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut active = self.inner.active.lock();
        while *active > 0 {
            tracing::debug!(count = *active, "waiting for workers to exit");
            if self
                .inner
                .all_closed
                .wait_until(&mut active, deadline)
                .timed_out()
            {
                return *active == 0;
            }
        }
        true
    }

    /// Returns the current number of active workers.
    pub fn active_count(&self) -> usize {
        *self.inner.active.lock()
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard that decrements the worker count when dropped.
pub struct WorkerGuard {
    inner: Arc<Inner>,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        let mut active = self.inner.active.lock();
        *active -= 1;
        if *active == 0 {
            // We were the last worker, notify waiters
            self.inner.all_closed.notify_all();
        }
    }
}
