use super::active::{ActiveSet, WorkerKind};
use super::cleanup::LoggingFlag;
use super::probe::WorkerProbe;
use super::task::{Daemon, DaemonContext, Step};
use crate::queue::pending::{TargetDescriptor, TargetKind};
use crate::runtime::fatal::{EscalationHandler, TimeoutError};
use crate::runtime::telemetry::Telemetry;
use anyhow::Result;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

/// Supplies the stall window. Called once, on the first sampling round.
pub type TimeoutSource = Box<dyn Fn() -> Duration + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogState {
    /// Nothing to watch; blocked until a worker becomes active.
    Idle,
    Sampling,
    /// A stall was confirmed. Terminal.
    Escalating,
}

impl WatchdogState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => WatchdogState::Sampling,
            2 => WatchdogState::Escalating,
            _ => WatchdogState::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            WatchdogState::Idle => 0,
            WatchdogState::Sampling => 1,
            WatchdogState::Escalating => 2,
        }
    }
}

/// Shared state the watchdog observes.
#[derive(Clone)]
pub struct Watched {
    pub active: Arc<ActiveSet>,
    pub cleanup: Arc<WorkerProbe>,
    pub relay: Arc<WorkerProbe>,
    pub logging: Arc<LoggingFlag>,
}

/// Detects a cleanup or relay worker that stays active without progress for a
/// whole timeout window and escalates it.
pub struct WatchdogWorker {
    watched: Watched,
    escalation: EscalationHandler,
    telemetry: Arc<Telemetry>,
    timeout_source: TimeoutSource,
    timeout: OnceLock<Duration>,
    wakeups: u32,
    tolerated_relay_stalls: u32,
    state: AtomicU8,
}

impl WatchdogWorker {
    pub fn new(
        watched: Watched,
        escalation: EscalationHandler,
        telemetry: Arc<Telemetry>,
        timeout_source: TimeoutSource,
        wakeups: u32,
        tolerated_relay_stalls: u32,
    ) -> Self {
        Self {
            watched,
            escalation,
            telemetry,
            timeout_source,
            timeout: OnceLock::new(),
            wakeups: wakeups.max(2),
            tolerated_relay_stalls: tolerated_relay_stalls.max(1),
            state: AtomicU8::new(WatchdogState::Idle.as_u8()),
        }
    }

    pub fn state(&self) -> WatchdogState {
        WatchdogState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// The cached stall window, once the first round has read it.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.get().copied()
    }

    fn set_state(&self, state: WatchdogState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    /// Sleeps at least `duration`. Returns `false` if the watchdog was stopped meanwhile.
    fn sleep_for(&self, ctx: &DaemonContext, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if !ctx.is_running() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            // Unparked by stop(); spurious wakeups just loop.
            thread::park_timeout(deadline - now);
        }
    }

    fn stalled(&self, worker: WorkerKind, start_count: u64) -> bool {
        let probe = match worker {
            WorkerKind::Cleanup => &self.watched.cleanup,
            WorkerKind::Relay => &self.watched.relay,
        };
        self.watched.active.is_active(worker) && probe.progress().get() == start_count
    }

    /// One sampling round. Returns the error to escalate, if any.
    pub(crate) fn wait_for_progress(&self, ctx: &DaemonContext) -> Option<TimeoutError> {
        let timeout = *self.timeout.get_or_init(|| (self.timeout_source)());
        let slice = timeout / self.wakeups;

        // Counters are read before the active bits so a transition to inactive
        // always shows up as a counter change.
        let cleanup_start = self.watched.cleanup.progress().get();
        let monitor_cleanup = self.watched.active.is_active(WorkerKind::Cleanup);
        let relay_start = self.watched.relay.progress().get();
        let monitor_relay = self.watched.active.is_active(WorkerKind::Relay);
        let started_wall = SystemTime::now();
        let started = Instant::now();

        for wakeup in 1..=self.wakeups {
            if !self.sleep_for(ctx, slice) {
                return None;
            }
            if monitor_cleanup && self.stalled(WorkerKind::Cleanup, cleanup_start) {
                continue;
            }
            if monitor_relay && self.stalled(WorkerKind::Relay, relay_start) {
                continue;
            }
            if wakeup < self.wakeups {
                self.watched.relay.reset_stalls();
                self.sleep_for(ctx, slice * (self.wakeups - wakeup));
                return None;
            }
        }

        if monitor_cleanup && self.stalled(WorkerKind::Cleanup, cleanup_start) {
            return self.cleanup_stalled(timeout, started_wall, started);
        }

        if monitor_relay && self.stalled(WorkerKind::Relay, relay_start) {
            return self.relay_stalled(started);
        }
        self.watched.relay.reset_stalls();
        None
    }

    fn cleanup_stalled(
        &self,
        timeout: Duration,
        started_wall: SystemTime,
        started: Instant,
    ) -> Option<TimeoutError> {
        let was_processing = self.watched.cleanup.current();

        if self.watched.logging.mark_timed_out() {
            // If the log line does complete, the worker escalates on its own as well.
            tracing::warn!(
                target: "cleanupd::watchdog",
                "cleanup worker stalled while logging a failure"
            );
        }

        tracing::error!(
            target: "cleanupd::watchdog",
            was_processing = %Described(was_processing.as_deref()),
            now_processing = %Described(self.watched.cleanup.current().as_deref()),
            "cleanup worker made no progress"
        );
        tracing::error!(
            target: "cleanupd::watchdog",
            elapsed_wall_ms = SystemTime::now()
                .duration_since(started_wall)
                .unwrap_or_default()
                .as_millis() as u64,
            elapsed_ns = started.elapsed().as_nanos() as u64,
            "cleanup stall window elapsed"
        );

        let message = cleanup_timeout_message(was_processing.as_deref(), timeout);
        Some(TimeoutError::new(
            WorkerKind::Cleanup,
            message,
            was_processing.as_deref().cloned(),
            started.elapsed(),
            self.watched.cleanup.thread().as_deref().cloned(),
        ))
    }

    fn relay_stalled(&self, started: Instant) -> Option<TimeoutError> {
        let target = self.watched.relay.current();
        let described = Described(target.as_deref()).to_string();
        let stalls = self.watched.relay.record_stall();
        self.telemetry.record_relay_stall();
        tracing::error!(
            target: "cleanupd::watchdog",
            relay_target = %described,
            consecutive = stalls,
            tolerated = self.tolerated_relay_stalls,
            elapsed_ns = started.elapsed().as_nanos() as u64,
            "relay worker made no progress"
        );

        if stalls < self.tolerated_relay_stalls {
            return None;
        }
        Some(TimeoutError::new(
            WorkerKind::Relay,
            format!("relay worker timed out while targeting {described}"),
            target.as_deref().cloned(),
            started.elapsed(),
            self.watched.relay.thread().as_deref().cloned(),
        ))
    }
}

fn cleanup_timeout_message(target: Option<&TargetDescriptor>, timeout: Duration) -> String {
    let Some(target) = target else {
        return "Unknown cleanup action timed out".to_string();
    };
    let secs = timeout.as_secs_f64();
    match target.kind() {
        TargetKind::Object => format!(
            "{}.finalize() timed out after {secs:.1} seconds",
            target.type_name()
        ),
        TargetKind::Cleanable | TargetKind::Hook | TargetKind::Batch => {
            format!("{} timed out after {secs:.1} seconds", target.type_name())
        }
    }
}

struct Described<'a>(Option<&'a TargetDescriptor>);

impl fmt::Display for Described<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(target) => fmt::Display::fmt(target, f),
            None => f.write_str("unknown"),
        }
    }
}

impl Daemon for WatchdogWorker {
    fn name(&self) -> &'static str {
        "WatchdogWorker"
    }

    fn run_once(&self, ctx: &DaemonContext) -> Result<Step> {
        self.set_state(WatchdogState::Idle);
        if !self.watched.active.wait_until_any_active(ctx.shutdown()) {
            return Ok(Step::Continue);
        }

        self.set_state(WatchdogState::Sampling);
        self.telemetry.record_watchdog_round();
        let Some(error) = self.wait_for_progress(ctx) else {
            return Ok(Step::Continue);
        };

        if self.escalation.debugger_attached() {
            tracing::warn!(
                target: "cleanupd::watchdog",
                error = %error,
                "debugger attached; not escalating stall"
            );
            return Ok(Step::Continue);
        }

        self.set_state(WatchdogState::Escalating);
        self.escalation.escalate(error);
        Ok(Step::Finished)
    }

    fn interrupt(&self) {
        self.watched.active.interrupt_waiters();
    }
}
