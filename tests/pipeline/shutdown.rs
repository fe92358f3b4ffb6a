use std::time::{Duration, Instant};

use crate::support::helpers::{init_tracing, test_config, wait_until, Harness};
use anyhow::Result;
use cleanupd::{CleanupItem, Pipeline, WatchdogState, WorkerKind};

#[test]
fn stop_returns_promptly_while_workers_are_blocked() -> Result<()> {
    init_tracing();
    let harness = Harness::new();
    let pipeline = Pipeline::new(test_config(Duration::from_secs(2), 5), harness.hooks(None));
    pipeline.start()?;

    // Both workers drain to their condition waits and the watchdog parks until
    // something becomes active.
    assert!(wait_until(Duration::from_secs(5), || {
        pipeline.watchdog_state() == WatchdogState::Idle
            && pipeline.cleanup_probe().progress().get() > 0
            && pipeline.relay_probe().progress().get() > 0
    }));

    let started = Instant::now();
    pipeline.stop()?;
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(!pipeline.is_running());
    Ok(())
}

#[test]
fn stop_interrupts_a_sampling_watchdog() -> Result<()> {
    init_tracing();
    let harness = Harness::new();
    let pipeline = Pipeline::new(test_config(Duration::from_secs(30), 5), harness.hooks(None));
    pipeline.start()?;

    pipeline
        .feed()
        .push(CleanupItem::named_cleanable("brief", || {
            std::thread::sleep(Duration::from_millis(50));
            Ok(())
        }));
    assert!(wait_until(Duration::from_secs(5), || {
        pipeline.watchdog_state() == WatchdogState::Sampling
    }));

    // The watchdog is inside a 6 s sub-interval sleep.
    let started = Instant::now();
    pipeline.stop()?;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(harness.recorder.errors().is_empty());
    Ok(())
}

#[test]
fn fresh_instances_start_and_double_start_fails() -> Result<()> {
    init_tracing();
    let harness = Harness::new();

    let first = Pipeline::new(test_config(Duration::from_secs(2), 5), harness.hooks(None));
    first.start()?;
    let err = first.start().expect_err("second start must fail");
    assert!(
        format!("{err:#}").contains("already running"),
        "unexpected error: {err:#}"
    );
    first.stop()?;
    assert!(first.start().is_err(), "stopped pipeline must not restart");

    let second = Pipeline::new(test_config(Duration::from_secs(2), 5), harness.hooks(None));
    second.start()?;
    assert!(second.is_running());
    assert_eq!(second.cleanup_probe().kind(), WorkerKind::Cleanup);
    second.stop()?;
    Ok(())
}
