use std::any::type_name;
use std::collections::{TryReserveError, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;

/// Zero-argument cleanup procedure. Owns whatever it needs to clean up.
pub type CleanupAction = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>;

static NEXT_TARGET_ID: AtomicU64 = AtomicU64::new(1);

/// What a [`TargetDescriptor`] points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    /// An unreachable object handed to its finalizer.
    Object,
    /// A registered cleanable; only the action runs.
    Cleanable,
    /// A post-cycle callback run by the relay worker.
    Hook,
    /// A batch the relay worker is moving into the pending queue.
    Batch,
}

/// Printable identity of a cleanup target.
///
/// Holds no reference to the target itself, so logging or reporting it never keeps
/// the target alive and never runs user code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetDescriptor {
    kind: TargetKind,
    type_name: &'static str,
    id: u64,
}

impl TargetDescriptor {
    pub fn new(kind: TargetKind, type_name: &'static str) -> Self {
        Self {
            kind,
            type_name,
            id: NEXT_TARGET_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub(crate) fn post_cycle_hook() -> Self {
        Self::new(TargetKind::Hook, "post-cycle hook")
    }

    pub(crate) fn relay_batch() -> Self {
        Self::new(TargetKind::Batch, "pending batch")
    }

    pub fn kind(&self) -> TargetKind {
        self.kind
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl fmt::Display for TargetDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{:x}", self.type_name, self.id)
    }
}

/// One unit of work for the cleanup worker.
///
/// Built either from an object plus the finalizer that consumes it, or from a bare
/// cleanable action. The object moves into the action call and is dropped when the
/// call returns, before any failure is logged.
pub struct CleanupItem {
    descriptor: TargetDescriptor,
    action: CleanupAction,
}

impl CleanupItem {
    pub fn object<T, F>(object: T, finalizer: F) -> Self
    where
        T: Send + 'static,
        F: FnOnce(T) -> anyhow::Result<()> + Send + 'static,
    {
        Self {
            descriptor: TargetDescriptor::new(TargetKind::Object, type_name::<T>()),
            action: Box::new(move || finalizer(object)),
        }
    }

    pub fn cleanable<F>(action: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        Self {
            descriptor: TargetDescriptor::new(TargetKind::Cleanable, type_name::<F>()),
            action: Box::new(action),
        }
    }

    /// Like [`cleanable`](Self::cleanable) but reported under `name` instead of the
    /// closure's type name.
    pub fn named_cleanable<F>(name: &'static str, action: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        Self {
            descriptor: TargetDescriptor::new(TargetKind::Cleanable, name),
            action: Box::new(action),
        }
    }

    pub fn descriptor(&self) -> &TargetDescriptor {
        &self.descriptor
    }

    pub(crate) fn into_parts(self) -> (TargetDescriptor, CleanupAction) {
        (self.descriptor, self.action)
    }
}

impl fmt::Debug for CleanupItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CleanupItem")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

/// Unbounded FIFO of items waiting for the cleanup worker.
///
/// Single producer (relay worker), single consumer (cleanup worker). One monitor
/// guards both the items and the "items available" condition.
#[derive(Default)]
pub struct PendingQueue {
    items: Mutex<VecDeque<CleanupItem>>,
    available: Condvar,
    #[cfg(test)]
    fail_next_append: std::sync::atomic::AtomicBool,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, item: CleanupItem) {
        self.lock().push_back(item);
        self.available.notify_one();
    }

    /// Appends a whole batch in order.
    ///
    /// If the queue cannot grow, the batch is dropped and the allocation error is
    /// returned; the queue is left unchanged.
    pub fn append(&self, batch: Vec<CleanupItem>) -> Result<usize, TryReserveError> {
        let count = batch.len();
        if count == 0 {
            return Ok(0);
        }
        {
            let mut items = self.lock();
            #[cfg(test)]
            if self.fail_next_append.swap(false, Ordering::SeqCst) {
                items.try_reserve(usize::MAX)?;
            }
            items.try_reserve(count)?;
            items.extend(batch);
        }
        self.available.notify_one();
        Ok(count)
    }

    /// Non-blocking poll.
    pub fn poll(&self) -> Option<CleanupItem> {
        self.lock().pop_front()
    }

    /// Blocks until an item is available. Returns `None` once `shutdown` fires.
    pub fn take(&self, shutdown: &CancellationToken) -> Option<CleanupItem> {
        let mut items = self.lock();
        loop {
            if let Some(item) = items.pop_front() {
                return Some(item);
            }
            if shutdown.is_cancelled() {
                return None;
            }
            items = self
                .available
                .wait(items)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Wakes a blocked [`take`](Self::take) so it rechecks its shutdown token.
    pub fn interrupt_waiters(&self) {
        let _items = self.lock();
        self.available.notify_all();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Makes the next non-empty [`append`](Self::append) fail as if the queue
    /// could not grow.
    #[cfg(test)]
    pub(crate) fn fail_next_append(&self) {
        self.fail_next_append.store(true, Ordering::SeqCst);
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, VecDeque<CleanupItem>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for PendingQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingQueue")
            .field("len", &self.len())
            .finish()
    }
}
