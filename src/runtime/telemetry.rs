use crate::queue::pending::PendingQueue;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Default interval used by the metrics reporter task.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(5);

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs a basic tracing subscriber (if one is not already active).
///
/// The subscriber honours `RUST_LOG` if it is present, otherwise it falls back to `info`.
/// Calling this function multiple times is harmless.
pub fn init_tracing() {
    if TRACING_INIT.get().is_some() {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .try_init();

    let _ = TRACING_INIT.set(());
}

/// Rolling counters for the cleanup pipeline.
#[derive(Default, Debug)]
pub struct Telemetry {
    items_processed: AtomicU64,
    cleanup_failures: AtomicU64,
    batches_relayed: AtomicU64,
    entries_relayed: AtomicU64,
    entries_dropped: AtomicU64,
    post_cycle_callbacks: AtomicU64,
    watchdog_rounds: AtomicU64,
    relay_stall_rounds: AtomicU64,
}

impl Telemetry {
    pub fn record_item_processed(&self) {
        self.items_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cleanup_failure(&self) {
        self.cleanup_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_relayed(&self, entries: usize) {
        if entries == 0 {
            return;
        }
        self.batches_relayed.fetch_add(1, Ordering::Relaxed);
        self.entries_relayed
            .fetch_add(entries as u64, Ordering::Relaxed);
    }

    pub fn record_entries_dropped(&self, entries: usize) {
        self.entries_dropped
            .fetch_add(entries as u64, Ordering::Relaxed);
    }

    pub fn record_post_cycle_callback(&self) {
        self.post_cycle_callbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_watchdog_round(&self) {
        self.watchdog_rounds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_relay_stall(&self) {
        self.relay_stall_rounds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            items_processed: self.items_processed.load(Ordering::Relaxed),
            cleanup_failures: self.cleanup_failures.load(Ordering::Relaxed),
            batches_relayed: self.batches_relayed.load(Ordering::Relaxed),
            entries_relayed: self.entries_relayed.load(Ordering::Relaxed),
            entries_dropped: self.entries_dropped.load(Ordering::Relaxed),
            post_cycle_callbacks: self.post_cycle_callbacks.load(Ordering::Relaxed),
            watchdog_rounds: self.watchdog_rounds.load(Ordering::Relaxed),
            relay_stall_rounds: self.relay_stall_rounds.load(Ordering::Relaxed),
        }
    }

    pub fn items_processed(&self) -> u64 {
        self.items_processed.load(Ordering::Relaxed)
    }

    pub fn cleanup_failures(&self) -> u64 {
        self.cleanup_failures.load(Ordering::Relaxed)
    }

    pub fn post_cycle_callbacks(&self) -> u64 {
        self.post_cycle_callbacks.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub items_processed: u64,
    pub cleanup_failures: u64,
    pub batches_relayed: u64,
    pub entries_relayed: u64,
    pub entries_dropped: u64,
    pub post_cycle_callbacks: u64,
    pub watchdog_rounds: u64,
    pub relay_stall_rounds: u64,
}

/// Spawns a background task that periodically logs cleanup throughput and queue depth.
pub fn spawn_metrics_reporter(
    telemetry: Arc<Telemetry>,
    pending: Arc<PendingQueue>,
    shutdown: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_snapshot = telemetry.snapshot();
        let mut last_tick = Instant::now();

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(target: "cleanupd::metrics", "metrics reporter shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let current = telemetry.snapshot();
                    let processed_delta = current
                        .items_processed
                        .saturating_sub(last_snapshot.items_processed);
                    let elapsed = last_tick.elapsed().as_secs_f64();
                    let throughput = if elapsed <= f64::EPSILON {
                        0.0
                    } else {
                        processed_delta as f64 / elapsed
                    };

                    tracing::info!(
                        target: "cleanupd::metrics",
                        throughput = format!("{throughput:.2}"),
                        processed = current.items_processed,
                        failures = current.cleanup_failures,
                        pending = pending.len(),
                        relayed = current.entries_relayed,
                        dropped = current.entries_dropped,
                        post_cycle_callbacks = current.post_cycle_callbacks,
                        watchdog_rounds = current.watchdog_rounds,
                        relay_stall_rounds = current.relay_stall_rounds,
                        "cleanup pipeline metrics snapshot"
                    );

                    last_snapshot = current;
                    last_tick = Instant::now();
                }
            }
        }
    })
}
