use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;

/// Workers the watchdog can monitor. Each maps to one bit of the [`ActiveSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerKind {
    Cleanup,
    Relay,
}

impl WorkerKind {
    fn bit(self) -> u32 {
        match self {
            WorkerKind::Cleanup => 1,
            WorkerKind::Relay => 2,
        }
    }

    pub fn thread_name(self) -> &'static str {
        match self {
            WorkerKind::Cleanup => "CleanupWorker",
            WorkerKind::Relay => "RelayWorker",
        }
    }
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerKind::Cleanup => f.write_str("cleanup worker"),
            WorkerKind::Relay => f.write_str("relay worker"),
        }
    }
}

/// Bitmask of workers that currently have outstanding work.
///
/// Workers must bump their progress counter right after [`mark_inactive`] and right
/// before [`mark_active`], so a watchdog that sampled the counter while the bit was
/// set always sees a counter change once the worker goes idle.
///
/// [`mark_inactive`]: ActiveSet::mark_inactive
/// [`mark_active`]: ActiveSet::mark_active
#[derive(Debug, Default)]
pub struct ActiveSet {
    bits: Mutex<u32>,
    became_active: Condvar,
}

impl ActiveSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_active(&self, worker: WorkerKind) {
        let mut bits = self.lock();
        let previous = *bits;
        *bits |= worker.bit();
        if previous == 0 {
            self.became_active.notify_all();
        }
    }

    pub fn mark_inactive(&self, worker: WorkerKind) {
        *self.lock() &= !worker.bit();
    }

    pub fn is_active(&self, worker: WorkerKind) -> bool {
        *self.lock() & worker.bit() != 0
    }

    pub fn any_active(&self) -> bool {
        *self.lock() != 0
    }

    /// Blocks until some worker is active. Returns `false` if `shutdown` fired first.
    pub fn wait_until_any_active(&self, shutdown: &CancellationToken) -> bool {
        let mut bits = self.lock();
        while *bits == 0 {
            if shutdown.is_cancelled() {
                return false;
            }
            bits = self
                .became_active
                .wait(bits)
                .unwrap_or_else(PoisonError::into_inner);
        }
        true
    }

    /// Wakes [`wait_until_any_active`](Self::wait_until_any_active) so it can recheck
    /// its shutdown token. Taking the lock first closes the check-then-wait gap.
    pub fn interrupt_waiters(&self) {
        let _bits = self.lock();
        self.became_active.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, u32> {
        self.bits.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
