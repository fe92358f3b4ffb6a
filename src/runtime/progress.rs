use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic progress counter owned by a single worker.
///
/// Only the owning worker increments it; the watchdog compares snapshots taken
/// at different times and never writes. Reads may be stale, which is harmless
/// because only a change between two snapshots matters.
#[derive(Debug, Default)]
pub struct ProgressCounter {
    value: AtomicU64,
}

impl ProgressCounter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    /// Records one unit of progress. Must only be called by the owning worker.
    pub fn increment(&self) -> u64 {
        // Single writer, so a load/store pair is enough and avoids a locked RMW.
        let next = self.value.load(Ordering::Relaxed).wrapping_add(1);
        self.value.store(next, Ordering::Release);
        next
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }
}
