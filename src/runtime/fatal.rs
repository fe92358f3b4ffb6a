use crate::queue::pending::TargetDescriptor;
use crate::workers::active::WorkerKind;
use anyhow::{Context, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fmt;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, Thread, ThreadId};
use std::time::Duration;

/// Exit status used when a stall is escalated and no uncaught handler is installed.
pub const STALL_EXIT_STATUS: i32 = 2;

/// Receives the final [`TimeoutError`] instead of the process exiting.
pub type UncaughtHandler = Arc<dyn Fn(&TimeoutError) + Send + Sync + 'static>;

/// Identity of the thread a stalled worker was running on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadSnapshot {
    name: Option<String>,
    id: ThreadId,
}

impl ThreadSnapshot {
    pub fn of(thread: &Thread) -> Self {
        Self {
            name: thread.name().map(str::to_owned),
            id: thread.id(),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }
}

impl fmt::Display for ThreadSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "\"{}\" ({:?})",
            self.name.as_deref().unwrap_or("<unnamed>"),
            self.id
        )
    }
}

/// Fatal report describing a worker that made no progress for a full window.
///
/// Never retried: once built it is handed to [`EscalationHandler::escalate`].
#[derive(Debug, Clone)]
pub struct TimeoutError {
    worker: WorkerKind,
    message: String,
    target: Option<TargetDescriptor>,
    elapsed: Duration,
    thread: Option<ThreadSnapshot>,
}

impl TimeoutError {
    pub fn new(
        worker: WorkerKind,
        message: impl Into<String>,
        target: Option<TargetDescriptor>,
        elapsed: Duration,
        thread: Option<ThreadSnapshot>,
    ) -> Self {
        Self {
            worker,
            message: message.into(),
            target,
            elapsed,
            thread,
        }
    }

    pub fn worker(&self) -> WorkerKind {
        self.worker
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn target(&self) -> Option<&TargetDescriptor> {
        self.target.as_ref()
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Thread the stalled worker was running on, if it had started.
    pub fn thread(&self) -> Option<&ThreadSnapshot> {
        self.thread.as_ref()
    }
}

impl fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} stalled for {} ms",
            self.message,
            self.worker,
            self.elapsed.as_millis()
        )?;
        if let Some(thread) = &self.thread {
            write!(f, " on thread {thread}")?;
        }
        f.write_str(")")
    }
}

impl std::error::Error for TimeoutError {}

/// Process-level diagnostics used while escalating a stall.
pub trait Diagnostics: Send + Sync + 'static {
    /// Whether a debugger is attached; stalls are expected then and not escalated.
    fn debugger_attached(&self) -> bool {
        false
    }

    /// Asks the process to dump every thread's stack.
    fn request_stack_dump(&self) -> Result<()>;
}

/// Default [`Diagnostics`]: signals the current process and checks `TracerPid`.
///
/// The host is expected to handle the signal by dumping stacks; an unhandled
/// `SIGQUIT` terminates the process with a core dump, which is also a usable trace.
#[derive(Debug, Clone, Copy)]
pub struct SignalDiagnostics {
    signal: Signal,
}

impl SignalDiagnostics {
    pub fn new(signal: Signal) -> Self {
        Self { signal }
    }
}

impl Default for SignalDiagnostics {
    fn default() -> Self {
        Self::new(Signal::SIGQUIT)
    }
}

impl Diagnostics for SignalDiagnostics {
    fn debugger_attached(&self) -> bool {
        let Ok(status) = fs::read_to_string("/proc/self/status") else {
            return false;
        };
        tracer_pid(&status).is_some_and(|pid| pid != 0)
    }

    fn request_stack_dump(&self) -> Result<()> {
        kill(Pid::this(), self.signal)
            .with_context(|| format!("failed to send {} to own process", self.signal))
    }
}

fn tracer_pid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("TracerPid:"))
        .and_then(|value| value.trim().parse().ok())
}

/// One-shot escalation path for confirmed stalls.
///
/// The first call to [`escalate`](Self::escalate) requests a stack dump, waits for
/// it to flush, then hands the error to the uncaught handler or exits the process.
/// Later calls are ignored.
#[derive(Clone)]
pub struct EscalationHandler {
    inner: Arc<EscalationInner>,
}

struct EscalationInner {
    triggered: AtomicBool,
    captured_error: Mutex<Option<Arc<TimeoutError>>>,
    diagnostics: Arc<dyn Diagnostics>,
    uncaught: Option<UncaughtHandler>,
    dump_flush_delay: Duration,
}

impl EscalationHandler {
    pub fn new(
        diagnostics: Arc<dyn Diagnostics>,
        uncaught: Option<UncaughtHandler>,
        dump_flush_delay: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(EscalationInner {
                triggered: AtomicBool::new(false),
                captured_error: Mutex::new(None),
                diagnostics,
                uncaught,
                dump_flush_delay,
            }),
        }
    }

    pub fn debugger_attached(&self) -> bool {
        self.inner.diagnostics.debugger_attached()
    }

    /// Runs the escalation to completion on the calling thread.
    ///
    /// Returns `false` if an earlier escalation already ran. Does not return at all
    /// when no uncaught handler is installed.
    pub fn escalate(&self, error: TimeoutError) -> bool {
        if self.inner.triggered.swap(true, Ordering::SeqCst) {
            tracing::warn!(error = %error, "stall reported after escalation already ran");
            return false;
        }

        tracing::error!(
            target: "cleanupd::watchdog",
            worker = %error.worker(),
            elapsed_ms = error.elapsed().as_millis() as u64,
            error = %error,
            "cleanup pipeline stalled; escalating"
        );

        let error = Arc::new(error);
        {
            let mut slot = self
                .inner
                .captured_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if slot.is_none() {
                *slot = Some(Arc::clone(&error));
            }
        }

        match self.inner.diagnostics.request_stack_dump() {
            Ok(()) => {
                if !self.inner.dump_flush_delay.is_zero() {
                    thread::sleep(self.inner.dump_flush_delay);
                }
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to request stack dump");
            }
        }

        match &self.inner.uncaught {
            Some(handler) => handler(error.as_ref()),
            None => {
                tracing::error!(error = %error, "no uncaught handler installed; exiting");
                std::process::exit(STALL_EXIT_STATUS);
            }
        }

        true
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    /// The first escalated error, if any.
    pub fn error(&self) -> Option<Arc<TimeoutError>> {
        self.inner
            .captured_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl fmt::Debug for EscalationHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EscalationHandler")
            .field("triggered", &self.is_triggered())
            .field("has_uncaught_handler", &self.inner.uncaught.is_some())
            .field("dump_flush_delay", &self.inner.dump_flush_delay)
            .finish()
    }
}
