//! Shared lifecycle for the perpetual daemon threads.

use crate::runtime::hooks::{run_guarded, HookDecision};
use anyhow::Result;
use std::fmt;
use std::io;
use std::mem;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, Thread};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Result of one [`Daemon::run_once`] iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    /// The daemon reached a terminal state; the thread exits without a stop request.
    Finished,
}

/// Per-thread context handed to a running daemon.
#[derive(Debug, Clone)]
pub struct DaemonContext {
    shutdown: CancellationToken,
}

impl DaemonContext {
    pub(crate) fn new(shutdown: CancellationToken) -> Self {
        Self { shutdown }
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    pub fn shutdown(&self) -> &CancellationToken {
        &self.shutdown
    }
}

/// Work performed by a [`DaemonTask`] thread.
pub trait Daemon: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Runs once on the daemon thread before the first iteration.
    fn on_start(&self, _ctx: &DaemonContext) {}

    /// One loop iteration. Errors and panics are logged and the loop keeps going.
    fn run_once(&self, ctx: &DaemonContext) -> Result<Step>;

    /// Wakes any condition variable the daemon may be blocked on.
    fn interrupt(&self) {}
}

#[derive(Debug)]
pub enum LifecycleError {
    AlreadyRunning(&'static str),
    NotRunning(&'static str),
    /// The task was stopped and cannot be started again.
    Stopped(&'static str),
    Spawn { name: &'static str, source: io::Error },
}

impl fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleError::AlreadyRunning(name) => write!(f, "{name} is already running"),
            LifecycleError::NotRunning(name) => write!(f, "{name} is not running"),
            LifecycleError::Stopped(name) => {
                write!(f, "{name} was stopped and cannot be restarted")
            }
            LifecycleError::Spawn { name, source } => {
                write!(f, "failed to spawn {name} thread: {source}")
            }
        }
    }
}

impl std::error::Error for LifecycleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LifecycleError::Spawn { source, .. } => Some(source),
            _ => None,
        }
    }
}

enum TaskState {
    Idle,
    Running {
        handle: JoinHandle<()>,
        shutdown: CancellationToken,
    },
    Stopped,
}

/// Owns the dedicated thread of one [`Daemon`].
pub struct DaemonTask<D: Daemon> {
    daemon: Arc<D>,
    state: Mutex<TaskState>,
}

impl<D: Daemon> DaemonTask<D> {
    pub fn new(daemon: Arc<D>) -> Self {
        Self {
            daemon,
            state: Mutex::new(TaskState::Idle),
        }
    }

    pub fn daemon(&self) -> &Arc<D> {
        &self.daemon
    }

    pub fn name(&self) -> &'static str {
        self.daemon.name()
    }

    /// Spawns the daemon thread and returns immediately.
    ///
    /// `latch` is counted down by the new thread once [`Daemon::on_start`] has run.
    pub fn start(&self, latch: Option<Arc<StartupLatch>>) -> Result<(), LifecycleError> {
        let name = self.daemon.name();
        let mut state = self.lock();
        match &*state {
            TaskState::Running { .. } => return Err(LifecycleError::AlreadyRunning(name)),
            TaskState::Stopped => return Err(LifecycleError::Stopped(name)),
            TaskState::Idle => {}
        }

        let shutdown = CancellationToken::new();
        let ctx = DaemonContext::new(shutdown.clone());
        let daemon = Arc::clone(&self.daemon);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_loop(daemon, ctx, latch))
            .map_err(|source| LifecycleError::Spawn { name, source })?;

        *state = TaskState::Running { handle, shutdown };
        Ok(())
    }

    /// True while the daemon thread is alive. A daemon whose loop has finished
    /// reports `false` even before [`stop`](Self::stop) is called.
    pub fn is_running(&self) -> bool {
        matches!(&*self.lock(), TaskState::Running { handle, .. } if !handle.is_finished())
    }

    /// Handle to the daemon thread while it is running.
    pub fn thread(&self) -> Option<Thread> {
        match &*self.lock() {
            TaskState::Running { handle, .. } => Some(handle.thread().clone()),
            _ => None,
        }
    }

    /// Wakes the daemon from a blocking wait or sleep without stopping it.
    pub fn interrupt(&self) -> Result<(), LifecycleError> {
        let state = self.lock();
        match &*state {
            TaskState::Running { handle, .. } => {
                self.daemon.interrupt();
                handle.thread().unpark();
                Ok(())
            }
            _ => Err(LifecycleError::NotRunning(self.daemon.name())),
        }
    }

    /// Requests shutdown and blocks until the daemon thread has exited.
    pub fn stop(&self) -> Result<(), LifecycleError> {
        let name = self.daemon.name();
        let (handle, shutdown) = {
            let mut state = self.lock();
            match mem::replace(&mut *state, TaskState::Stopped) {
                TaskState::Running { handle, shutdown } => (handle, shutdown),
                TaskState::Idle => {
                    *state = TaskState::Idle;
                    return Err(LifecycleError::NotRunning(name));
                }
                TaskState::Stopped => return Err(LifecycleError::NotRunning(name)),
            }
        };

        shutdown.cancel();
        self.daemon.interrupt();
        handle.thread().unpark();

        if handle.thread().id() == thread::current().id() {
            // Stopping from inside the daemon itself; the loop exits on its own.
            return Ok(());
        }

        if handle.join().is_err() {
            tracing::warn!(daemon = name, "daemon thread panicked outside its loop");
        }
        tracing::debug!(daemon = name, "daemon thread joined");
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, TaskState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<D: Daemon> fmt::Debug for DaemonTask<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DaemonTask")
            .field("name", &self.daemon.name())
            .field("running", &self.is_running())
            .finish()
    }
}

fn run_loop<D: Daemon>(daemon: Arc<D>, ctx: DaemonContext, latch: Option<Arc<StartupLatch>>) {
    let name = daemon.name();
    tracing::info!(daemon = name, "daemon thread started");

    if let HookDecision::Panicked(panic) = run_guarded(|| {
        daemon.on_start(&ctx);
        Ok(())
    }) {
        tracing::error!(daemon = name, panic = %panic, "daemon start hook panicked");
    }
    if let Some(latch) = latch {
        latch.count_down();
    }

    while ctx.is_running() {
        match run_guarded(|| daemon.run_once(&ctx)) {
            HookDecision::Finished(Ok(Step::Continue)) => {}
            HookDecision::Finished(Ok(Step::Finished)) => break,
            HookDecision::Finished(Err(err)) => {
                tracing::error!(daemon = name, error = %err, "daemon iteration failed");
            }
            HookDecision::Panicked(panic) => {
                tracing::error!(daemon = name, panic = %panic, "daemon iteration panicked");
            }
        }
    }

    tracing::info!(daemon = name, "daemon thread exiting");
}

/// Count-down latch the orchestrator waits on until every daemon thread is up.
#[derive(Debug)]
pub struct StartupLatch {
    remaining: Mutex<usize>,
    released: Condvar,
}

impl StartupLatch {
    pub fn new(count: usize) -> Self {
        Self {
            remaining: Mutex::new(count),
            released: Condvar::new(),
        }
    }

    pub fn count_down(&self) {
        let mut remaining = self.lock();
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            self.released.notify_all();
        }
    }

    pub fn remaining(&self) -> usize {
        *self.lock()
    }

    /// Waits up to `timeout` for the count to reach zero. Returns whether it did.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut remaining = self.lock();
        while *remaining > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            remaining = self
                .released
                .wait_timeout(remaining, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    fn lock(&self) -> MutexGuard<'_, usize> {
        self.remaining.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
