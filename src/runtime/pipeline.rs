use crate::queue::feed::UnreachableFeed;
use crate::queue::pending::PendingQueue;
use crate::runtime::config::PipelineConfig;
use crate::runtime::fatal::{Diagnostics, EscalationHandler, SignalDiagnostics, UncaughtHandler};
use crate::runtime::hooks::PostCycleHook;
use crate::runtime::telemetry::Telemetry;
use crate::workers::active::ActiveSet;
use crate::workers::cleanup::{CleanupWorker, LoggingFlag};
use crate::workers::probe::WorkerProbe;
use crate::workers::relay::RelayWorker;
use crate::workers::task::{DaemonTask, LifecycleError, StartupLatch};
use crate::workers::watchdog::{WatchdogState, WatchdogWorker, Watched};
use anyhow::{anyhow, Context, Result};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

const STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Integration points supplied by the host.
#[derive(Clone)]
pub struct PipelineHooks {
    /// Run by the relay worker after each drained collection cycle.
    pub post_cycle: Option<PostCycleHook>,
    pub diagnostics: Arc<dyn Diagnostics>,
    /// Receives a confirmed stall. When `None`, the process exits with status 2.
    pub uncaught: Option<UncaughtHandler>,
}

impl Default for PipelineHooks {
    fn default() -> Self {
        Self {
            post_cycle: None,
            diagnostics: Arc::new(SignalDiagnostics::default()),
            uncaught: None,
        }
    }
}

/// Owns the relay, cleanup and watchdog daemons and starts/stops them as a unit.
///
/// A pipeline runs at most once: after [`stop`](Self::stop) build a fresh instance.
pub struct Pipeline {
    config: PipelineConfig,
    feed: Arc<UnreachableFeed>,
    pending: Arc<PendingQueue>,
    telemetry: Arc<Telemetry>,
    escalation: EscalationHandler,
    relay: DaemonTask<RelayWorker>,
    cleanup: DaemonTask<CleanupWorker>,
    watchdog: DaemonTask<WatchdogWorker>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, hooks: PipelineHooks) -> Self {
        let feed = Arc::new(UnreachableFeed::new());
        let pending = Arc::new(PendingQueue::new());
        let active = Arc::new(ActiveSet::new());
        let logging = Arc::new(LoggingFlag::new());
        let telemetry = Arc::new(Telemetry::default());
        let escalation =
            EscalationHandler::new(hooks.diagnostics, hooks.uncaught, config.dump_flush_delay());

        let relay = Arc::new(RelayWorker::new(
            Arc::clone(&feed),
            Arc::clone(&pending),
            Arc::clone(&active),
            hooks.post_cycle,
            Arc::clone(&telemetry),
        ));
        let cleanup = Arc::new(CleanupWorker::new(
            Arc::clone(&pending),
            Arc::clone(&active),
            Arc::clone(&logging),
            escalation.clone(),
            Arc::clone(&telemetry),
        ));

        let timeout = config.cleanup_timeout();
        let watchdog = Arc::new(WatchdogWorker::new(
            Watched {
                active,
                cleanup: Arc::clone(cleanup.probe()),
                relay: Arc::clone(relay.probe()),
                logging,
            },
            escalation.clone(),
            Arc::clone(&telemetry),
            Box::new(move || timeout),
            config.wakeups_per_timeout(),
            config.tolerated_relay_stalls(),
        ));

        Self {
            config,
            feed,
            pending,
            telemetry,
            escalation,
            relay: DaemonTask::new(relay),
            cleanup: DaemonTask::new(cleanup),
            watchdog: DaemonTask::new(watchdog),
        }
    }

    /// Starts the relay, cleanup and watchdog threads, in that order, and waits
    /// until each of them is up.
    pub fn start(&self) -> Result<()> {
        let latch = Arc::new(StartupLatch::new(3));

        self.relay
            .start(Some(Arc::clone(&latch)))
            .context("failed to start relay worker")?;
        if let Err(err) = self.cleanup.start(Some(Arc::clone(&latch))) {
            self.abandon_start(false);
            return Err(err).context("failed to start cleanup worker");
        }
        if let Err(err) = self.watchdog.start(Some(Arc::clone(&latch))) {
            self.abandon_start(true);
            return Err(err).context("failed to start watchdog");
        }

        if !latch.wait_timeout(STARTUP_TIMEOUT) {
            return Err(anyhow!(
                "{} daemon thread(s) did not report startup within {:?}",
                latch.remaining(),
                STARTUP_TIMEOUT
            ));
        }

        tracing::info!(
            timeout_ms = self.config.cleanup_timeout().as_millis() as u64,
            wakeups = self.config.wakeups_per_timeout(),
            "cleanup pipeline started"
        );
        Ok(())
    }

    /// Stops all three daemons, blocking until their threads exit.
    ///
    /// Every daemon is asked to stop even if an earlier one fails; the first
    /// failure is returned.
    pub fn stop(&self) -> Result<()> {
        let results = [
            self.watchdog.stop(),
            self.cleanup.stop(),
            self.relay.stop(),
        ];

        let mut first_error: Option<LifecycleError> = None;
        for result in results {
            if let Err(err) = result {
                tracing::warn!(error = %err, "daemon stop failed");
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => Err(err).context("failed to stop cleanup pipeline"),
            None => {
                tracing::info!("cleanup pipeline stopped");
                Ok(())
            }
        }
    }

    /// Stops the daemons this call to [`start`](Self::start) already launched.
    fn abandon_start(&self, cleanup_started: bool) {
        let mut results = Vec::with_capacity(2);
        if cleanup_started {
            results.push(self.cleanup.stop());
        }
        results.push(self.relay.stop());
        for err in results.into_iter().filter_map(Result::err) {
            tracing::warn!(error = %err, "failed to stop daemon after aborted start");
        }
    }

    /// True while all three daemon threads are alive.
    pub fn is_running(&self) -> bool {
        self.relay.is_running() && self.cleanup.is_running() && self.watchdog.is_running()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Inbound feed the memory manager fills with newly unreachable entries.
    pub fn feed(&self) -> &Arc<UnreachableFeed> {
        &self.feed
    }

    pub fn pending(&self) -> &Arc<PendingQueue> {
        &self.pending
    }

    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    pub fn escalation(&self) -> &EscalationHandler {
        &self.escalation
    }

    pub fn cleanup_probe(&self) -> &Arc<WorkerProbe> {
        self.cleanup.daemon().probe()
    }

    pub fn relay_probe(&self) -> &Arc<WorkerProbe> {
        self.relay.daemon().probe()
    }

    pub fn watchdog_state(&self) -> WatchdogState {
        self.watchdog.daemon().state()
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .field("relay", &self.relay)
            .field("cleanup", &self.cleanup)
            .field("watchdog", &self.watchdog)
            .field("pending", &self.pending)
            .finish()
    }
}
