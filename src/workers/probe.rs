use super::active::WorkerKind;
use crate::queue::pending::TargetDescriptor;
use crate::runtime::fatal::ThreadSnapshot;
use crate::runtime::progress::ProgressCounter;
use arc_swap::ArcSwapOption;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;

/// Liveness state a monitored worker publishes for the watchdog.
///
/// `current` is a best-effort diagnostic: the worker swaps it without coordinating
/// with readers, so the watchdog may observe a target that has just finished.
#[derive(Debug)]
pub struct WorkerProbe {
    kind: WorkerKind,
    progress: ProgressCounter,
    current: ArcSwapOption<TargetDescriptor>,
    thread: ArcSwapOption<ThreadSnapshot>,
    consecutive_stalls: AtomicU32,
}

impl WorkerProbe {
    pub fn new(kind: WorkerKind) -> Self {
        Self {
            kind,
            progress: ProgressCounter::new(),
            current: ArcSwapOption::empty(),
            thread: ArcSwapOption::empty(),
            consecutive_stalls: AtomicU32::new(0),
        }
    }

    pub fn kind(&self) -> WorkerKind {
        self.kind
    }

    pub fn progress(&self) -> &ProgressCounter {
        &self.progress
    }

    pub fn set_current(&self, target: Option<TargetDescriptor>) {
        self.current.store(target.map(Arc::new));
    }

    pub fn current(&self) -> Option<Arc<TargetDescriptor>> {
        self.current.load_full()
    }

    /// Records the calling thread as the one this worker runs on.
    pub fn attach_current_thread(&self) {
        self.thread
            .store(Some(Arc::new(ThreadSnapshot::of(&thread::current()))));
    }

    pub fn thread(&self) -> Option<Arc<ThreadSnapshot>> {
        self.thread.load_full()
    }

    /// Watchdog rounds in a row that found this worker stalled.
    pub fn consecutive_stalls(&self) -> u32 {
        self.consecutive_stalls.load(Ordering::Relaxed)
    }

    pub(crate) fn record_stall(&self) -> u32 {
        self.consecutive_stalls
            .fetch_add(1, Ordering::Relaxed)
            .saturating_add(1)
    }

    pub(crate) fn reset_stalls(&self) {
        self.consecutive_stalls.store(0, Ordering::Relaxed);
    }
}
