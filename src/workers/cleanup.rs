use super::active::{ActiveSet, WorkerKind};
use super::probe::WorkerProbe;
use super::task::{Daemon, DaemonContext, Step};
use crate::queue::pending::{CleanupItem, PendingQueue, TargetDescriptor};
use crate::runtime::fatal::{EscalationHandler, TimeoutError};
use crate::runtime::hooks::{run_guarded, HookDecision};
use crate::runtime::telemetry::Telemetry;
use anyhow::Result;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// What the cleanup worker is doing with a failed action's report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingState {
    Idle,
    /// Writing the failure of the current action to the log.
    Logging,
    /// The watchdog saw the worker stall while logging.
    TimedOut,
}

impl LoggingState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => LoggingState::Logging,
            2 => LoggingState::TimedOut,
            _ => LoggingState::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            LoggingState::Idle => 0,
            LoggingState::Logging => 1,
            LoggingState::TimedOut => 2,
        }
    }
}

/// Tri-state flag shared between the cleanup worker and the watchdog.
#[derive(Debug, Default)]
pub struct LoggingFlag {
    state: AtomicU8,
}

impl LoggingFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> LoggingState {
        LoggingState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn begin(&self) {
        self.state
            .store(LoggingState::Logging.as_u8(), Ordering::Release);
    }

    /// Resets to idle and returns the state the flag was in.
    pub(crate) fn finish(&self) -> LoggingState {
        LoggingState::from_u8(
            self.state
                .swap(LoggingState::Idle.as_u8(), Ordering::AcqRel),
        )
    }

    /// Flags a stalled log write. Returns `false` unless the worker was logging.
    pub(crate) fn mark_timed_out(&self) -> bool {
        self.state
            .compare_exchange(
                LoggingState::Logging.as_u8(),
                LoggingState::TimedOut.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

/// Runs queued cleanup actions one at a time, in FIFO order.
///
/// A failing or panicking action is logged and never escapes the worker.
pub struct CleanupWorker {
    pending: Arc<PendingQueue>,
    active: Arc<ActiveSet>,
    probe: Arc<WorkerProbe>,
    logging: Arc<LoggingFlag>,
    escalation: EscalationHandler,
    telemetry: Arc<Telemetry>,
}

impl CleanupWorker {
    pub fn new(
        pending: Arc<PendingQueue>,
        active: Arc<ActiveSet>,
        logging: Arc<LoggingFlag>,
        escalation: EscalationHandler,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            pending,
            active,
            probe: Arc::new(WorkerProbe::new(WorkerKind::Cleanup)),
            logging,
            escalation,
            telemetry,
        }
    }

    pub fn probe(&self) -> &Arc<WorkerProbe> {
        &self.probe
    }

    pub fn logging(&self) -> &Arc<LoggingFlag> {
        &self.logging
    }

    /// Blocks until an item is queued. `None` means shutdown was requested.
    fn next_item(&self, ctx: &DaemonContext) -> Option<CleanupItem> {
        if let Some(item) = self.pending.poll() {
            self.probe.progress().increment();
            return Some(item);
        }

        self.probe.set_current(None);
        self.active.mark_inactive(WorkerKind::Cleanup);
        self.probe.progress().increment();

        let item = self.pending.take(ctx.shutdown())?;

        self.probe.progress().increment();
        self.active.mark_active(WorkerKind::Cleanup);
        Some(item)
    }

    fn process(&self, item: CleanupItem) {
        let (target, action) = item.into_parts();
        self.probe.set_current(Some(target.clone()));

        // The action owns the target; it is dropped before anything is logged.
        match run_guarded(action) {
            HookDecision::Finished(Ok(())) => {}
            HookDecision::Finished(Err(err)) => {
                self.report_failure(&target, &format!("{err:#}"));
            }
            HookDecision::Panicked(panic) => {
                self.report_failure(&target, &format!("panicked: {panic}"));
            }
        }

        self.telemetry.record_item_processed();
        self.probe.set_current(None);
    }

    fn report_failure(&self, target: &TargetDescriptor, reason: &str) {
        let started = Instant::now();
        self.logging.begin();
        self.telemetry.record_cleanup_failure();
        tracing::error!(
            target: "cleanupd::cleanup",
            cleanup_target = %target,
            error = reason,
            "uncaught failure in cleanup action"
        );
        self.finish_report(target, started);
    }

    fn finish_report(&self, target: &TargetDescriptor, started: Instant) {
        if self.logging.finish() == LoggingState::TimedOut {
            let error = TimeoutError::new(
                WorkerKind::Cleanup,
                format!("timed out logging failure of {target}"),
                Some(target.clone()),
                started.elapsed(),
                self.probe.thread().as_deref().cloned(),
            );
            self.escalation.escalate(error);
        }
    }
}

impl Daemon for CleanupWorker {
    fn name(&self) -> &'static str {
        WorkerKind::Cleanup.thread_name()
    }

    fn on_start(&self, _ctx: &DaemonContext) {
        self.probe.attach_current_thread();
        self.active.mark_active(WorkerKind::Cleanup);
    }

    fn run_once(&self, ctx: &DaemonContext) -> Result<Step> {
        if let Some(item) = self.next_item(ctx) {
            self.process(item);
        }
        Ok(Step::Continue)
    }

    fn interrupt(&self) {
        self.pending.interrupt_waiters();
    }
}
