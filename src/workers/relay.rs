use super::active::{ActiveSet, WorkerKind};
use super::probe::WorkerProbe;
use super::task::{Daemon, DaemonContext, Step};
use crate::queue::feed::{FeedEvent, UnreachableFeed};
use crate::queue::pending::{CleanupItem, PendingQueue, TargetDescriptor};
use crate::runtime::hooks::{run_guarded, HookDecision, PostCycleHook};
use crate::runtime::telemetry::Telemetry;
use anyhow::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Moves newly unreachable entries from the collector's feed into the pending
/// queue and runs the post-cycle hook once a collection cycle has drained.
pub struct RelayWorker {
    feed: Arc<UnreachableFeed>,
    pending: Arc<PendingQueue>,
    active: Arc<ActiveSet>,
    probe: Arc<WorkerProbe>,
    post_cycle: Option<PostCycleHook>,
    telemetry: Arc<Telemetry>,
    last_cycle: AtomicU64,
}

impl RelayWorker {
    pub fn new(
        feed: Arc<UnreachableFeed>,
        pending: Arc<PendingQueue>,
        active: Arc<ActiveSet>,
        post_cycle: Option<PostCycleHook>,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            feed,
            pending,
            active,
            probe: Arc::new(WorkerProbe::new(WorkerKind::Relay)),
            post_cycle,
            telemetry,
            last_cycle: AtomicU64::new(0),
        }
    }

    pub fn probe(&self) -> &Arc<WorkerProbe> {
        &self.probe
    }

    fn relay_batch(&self, batch: Vec<CleanupItem>) {
        let entries = batch.len();
        self.probe.set_current(Some(TargetDescriptor::relay_batch()));
        let appended = self.pending.append(batch);
        self.probe.set_current(None);
        match appended {
            Ok(relayed) => {
                self.probe.progress().increment();
                self.telemetry.record_batch_relayed(relayed);
                self.probe.reset_stalls();
                tracing::trace!(target: "cleanupd::relay", relayed, "relayed batch");
            }
            Err(err) => {
                // The batch is gone; the worker keeps running.
                self.telemetry.record_entries_dropped(entries);
                tracing::warn!(
                    target: "cleanupd::relay",
                    dropped = entries,
                    error = %err,
                    "failed to grow pending queue; dropping batch"
                );
            }
        }
    }

    fn run_post_cycle(&self, cycle: u64) {
        self.last_cycle.store(cycle, Ordering::Relaxed);
        let Some(hook) = &self.post_cycle else {
            return;
        };

        self.probe
            .set_current(Some(TargetDescriptor::post_cycle_hook()));
        let hook = Arc::clone(hook);
        if let HookDecision::Panicked(panic) = run_guarded(move || {
            hook();
            Ok(())
        }) {
            tracing::error!(
                target: "cleanupd::relay",
                cycle,
                panic = %panic,
                "post-cycle hook panicked"
            );
        }
        self.telemetry.record_post_cycle_callback();
        self.probe.set_current(None);
    }
}

impl Daemon for RelayWorker {
    fn name(&self) -> &'static str {
        WorkerKind::Relay.thread_name()
    }

    fn on_start(&self, _ctx: &DaemonContext) {
        self.probe.attach_current_thread();
        self.probe.reset_stalls();
        self.last_cycle
            .store(self.feed.completed_cycles(), Ordering::Relaxed);
        self.active.mark_active(WorkerKind::Relay);
    }

    fn run_once(&self, ctx: &DaemonContext) -> Result<Step> {
        let last_cycle = self.last_cycle.load(Ordering::Relaxed);
        let event = self.feed.next_event(
            last_cycle,
            ctx.shutdown(),
            || {
                self.active.mark_inactive(WorkerKind::Relay);
                self.probe.progress().increment();
            },
            || {
                self.probe.progress().increment();
                self.active.mark_active(WorkerKind::Relay);
            },
        );

        match event {
            FeedEvent::Batch(batch) => self.relay_batch(batch),
            FeedEvent::CycleCompleted(cycle) => self.run_post_cycle(cycle),
            FeedEvent::Interrupted => {}
        }
        Ok(Step::Continue)
    }

    fn interrupt(&self) {
        self.feed.interrupt_waiters();
    }
}
