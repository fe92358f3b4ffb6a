use super::pending::CleanupItem;
use std::fmt;
use std::mem;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct FeedState {
    unenqueued: Vec<CleanupItem>,
    completed_cycles: u64,
}

/// What the relay worker should do next.
#[derive(Debug)]
pub(crate) enum FeedEvent {
    /// A detached batch, in arrival order.
    Batch(Vec<CleanupItem>),
    /// A collection cycle finished with nothing left to relay.
    CycleCompleted(u64),
    /// Shutdown was requested while waiting.
    Interrupted,
}

/// Inbound list of newly unreachable entries, filled by the memory manager.
///
/// The collector side calls [`push`](Self::push)/[`push_batch`](Self::push_batch) and
/// [`complete_cycle`](Self::complete_cycle); the relay worker detaches everything
/// queued so far in one step under the same monitor, so an entry is relayed exactly once.
#[derive(Default)]
pub struct UnreachableFeed {
    state: Mutex<FeedState>,
    changed: Condvar,
}

impl UnreachableFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, item: CleanupItem) {
        self.lock().unenqueued.push(item);
        self.changed.notify_one();
    }

    pub fn push_batch<I>(&self, items: I)
    where
        I: IntoIterator<Item = CleanupItem>,
    {
        let added = {
            let mut state = self.lock();
            let before = state.unenqueued.len();
            state.unenqueued.extend(items);
            state.unenqueued.len() != before
        };
        if added {
            self.changed.notify_one();
        }
    }

    /// Records the end of a collection cycle and returns the new cycle count.
    pub fn complete_cycle(&self) -> u64 {
        let cycles = {
            let mut state = self.lock();
            state.completed_cycles = state.completed_cycles.saturating_add(1);
            state.completed_cycles
        };
        self.changed.notify_one();
        cycles
    }

    pub fn completed_cycles(&self) -> u64 {
        self.lock().completed_cycles
    }

    /// Entries waiting to be detached by the relay worker.
    pub fn unrelayed(&self) -> usize {
        self.lock().unenqueued.len()
    }

    /// Swaps the queued entries out for an empty list.
    pub fn detach(&self) -> Vec<CleanupItem> {
        mem::take(&mut self.lock().unenqueued)
    }

    /// Waits for the next relay event while holding the feed monitor.
    ///
    /// `on_idle` runs right before blocking and `on_wake` right after, both under the
    /// monitor. `on_wake` is skipped when the wait ends because of shutdown.
    pub(crate) fn next_event<I, W>(
        &self,
        last_cycle: u64,
        shutdown: &CancellationToken,
        mut on_idle: I,
        mut on_wake: W,
    ) -> FeedEvent
    where
        I: FnMut(),
        W: FnMut(),
    {
        let mut state = self.lock();
        loop {
            if !state.unenqueued.is_empty() {
                return FeedEvent::Batch(mem::take(&mut state.unenqueued));
            }
            if state.completed_cycles > last_cycle {
                return FeedEvent::CycleCompleted(state.completed_cycles);
            }

            on_idle();
            while state.unenqueued.is_empty() && state.completed_cycles <= last_cycle {
                if shutdown.is_cancelled() {
                    return FeedEvent::Interrupted;
                }
                state = self
                    .changed
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            on_wake();
        }
    }

    /// Wakes the relay worker so it rechecks its shutdown token.
    pub fn interrupt_waiters(&self) {
        let _state = self.lock();
        self.changed.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, FeedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for UnreachableFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("UnreachableFeed")
            .field("unrelayed", &state.unenqueued.len())
            .field("completed_cycles", &state.completed_cycles)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn item(name: &'static str) -> CleanupItem {
        CleanupItem::named_cleanable(name, || Ok(()))
    }

    #[test]
    fn detach_empties_the_feed_in_arrival_order() {
        let feed = UnreachableFeed::new();
        feed.push(item("a"));
        feed.push_batch(vec![item("b"), item("c")]);
        assert_eq!(feed.unrelayed(), 3);

        let names: Vec<_> = feed
            .detach()
            .iter()
            .map(|item| item.descriptor().type_name())
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(feed.unrelayed(), 0);
        assert!(feed.detach().is_empty());
    }

    #[test]
    fn batch_is_preferred_over_cycle_completion() {
        let feed = UnreachableFeed::new();
        let shutdown = CancellationToken::new();
        feed.complete_cycle();
        feed.push(item("a"));

        match feed.next_event(0, &shutdown, || {}, || {}) {
            FeedEvent::Batch(batch) => assert_eq!(batch.len(), 1),
            other => panic!("expected batch, got {other:?}"),
        }
        match feed.next_event(0, &shutdown, || {}, || {}) {
            FeedEvent::CycleCompleted(cycles) => assert_eq!(cycles, 1),
            other => panic!("expected cycle completion, got {other:?}"),
        }
    }

    #[test]
    fn idle_and_wake_callbacks_straddle_the_wait() {
        let feed = Arc::new(UnreachableFeed::new());
        let shutdown = CancellationToken::new();

        let idle = Arc::new(AtomicBool::new(false));

        let relay = {
            let feed = Arc::clone(&feed);
            let shutdown = shutdown.clone();
            let idle = Arc::clone(&idle);
            thread::spawn(move || {
                let mut idles = 0;
                let mut wakes = 0;
                let event = feed.next_event(
                    0,
                    &shutdown,
                    || {
                        idles += 1;
                        idle.store(true, Ordering::SeqCst);
                    },
                    || wakes += 1,
                );
                (matches!(event, FeedEvent::Batch(_)), idles, wakes)
            })
        };

        while !idle.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(1));
        }
        feed.push(item("late"));
        assert_eq!(relay.join().unwrap(), (true, 1, 1));
    }

    #[test]
    fn interrupted_wait_skips_wake_callback() {
        let feed = Arc::new(UnreachableFeed::new());
        let shutdown = CancellationToken::new();

        let relay = {
            let feed = Arc::clone(&feed);
            let shutdown = shutdown.clone();
            thread::spawn(move || {
                let mut wakes = 0;
                let event = feed.next_event(0, &shutdown, || {}, || wakes += 1);
                (matches!(event, FeedEvent::Interrupted), wakes)
            })
        };

        thread::sleep(Duration::from_millis(20));
        shutdown.cancel();
        feed.interrupt_waiters();
        assert_eq!(relay.join().unwrap(), (true, 0));
    }

    #[test]
    fn concurrent_detach_never_loses_or_duplicates_entries() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 500;

        let feed = Arc::new(UnreachableFeed::new());
        let producers: Vec<_> = (0..PRODUCERS)
            .map(|_| {
                let feed = Arc::clone(&feed);
                thread::spawn(move || {
                    let mut ids = Vec::with_capacity(PER_PRODUCER);
                    for _ in 0..PER_PRODUCER {
                        let entry = item("entry");
                        ids.push(entry.descriptor().id());
                        feed.push(entry);
                    }
                    ids
                })
            })
            .collect();

        let mut relayed = Vec::new();
        while producers.iter().any(|handle| !handle.is_finished()) {
            relayed.extend(feed.detach().iter().map(|item| item.descriptor().id()));
        }
        let produced: HashSet<u64> = producers
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect();
        relayed.extend(feed.detach().iter().map(|item| item.descriptor().id()));

        let unique: HashSet<u64> = relayed.iter().copied().collect();
        assert_eq!(relayed.len(), PRODUCERS * PER_PRODUCER);
        assert_eq!(unique, produced);
    }
}
