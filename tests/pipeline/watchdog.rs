use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::support::helpers::{init_tracing, test_config, wait_until, Gate, Harness};
use anyhow::Result;
use cleanupd::{CleanupItem, Pipeline, PostCycleHook, WatchdogState, WorkerKind};

#[test]
fn slow_but_progressing_actions_never_escalate() -> Result<()> {
    init_tracing();
    let harness = Harness::new();
    // 100 ms sub-intervals; every action finishes well inside one.
    let pipeline = Pipeline::new(
        test_config(Duration::from_millis(500), 5),
        harness.hooks(None),
    );
    pipeline.start()?;

    pipeline.feed().push_batch((0..12).map(|_| {
        CleanupItem::named_cleanable("slow", || {
            thread::sleep(Duration::from_millis(60));
            Ok(())
        })
    }));

    assert!(wait_until(Duration::from_secs(5), || {
        pipeline.telemetry().items_processed() == 12
    }));
    thread::sleep(Duration::from_millis(600));

    assert!(!pipeline.escalation().is_triggered());
    assert!(harness.recorder.errors().is_empty());
    assert_eq!(harness.diagnostics.dumps(), 0);
    assert!(pipeline.telemetry().snapshot().watchdog_rounds >= 1);

    pipeline.stop()?;
    Ok(())
}

#[test]
fn blocked_action_escalates_with_the_cleanup_thread() -> Result<()> {
    init_tracing();
    let harness = Harness::new();
    let pipeline = Pipeline::new(
        test_config(Duration::from_millis(200), 5),
        harness.hooks(None),
    );
    pipeline.start()?;

    let gate = Arc::new(Gate::default());
    {
        let gate = Arc::clone(&gate);
        pipeline
            .feed()
            .push(CleanupItem::named_cleanable("stuck_socket_close", move || {
                gate.wait();
                Ok(())
            }));
    }

    let escalated = wait_until(Duration::from_secs(5), || {
        !harness.recorder.errors().is_empty()
    });
    gate.open();
    assert!(escalated, "blocked action was never reported");
    assert_eq!(gate.entered(), 1);

    let errors = harness.recorder.errors();
    assert_eq!(errors.len(), 1);
    let error = &errors[0];
    assert_eq!(error.worker(), WorkerKind::Cleanup);
    assert_eq!(
        error.message(),
        "stuck_socket_close timed out after 0.2 seconds"
    );
    assert_eq!(
        error.thread().and_then(|thread| thread.name()),
        Some("CleanupWorker")
    );
    assert_eq!(
        error.target().map(|target| target.type_name()),
        Some("stuck_socket_close")
    );
    assert!(error.elapsed() >= Duration::from_millis(200));
    assert_eq!(harness.diagnostics.dumps(), 1);
    assert_eq!(pipeline.watchdog_state(), WatchdogState::Escalating);

    pipeline.stop()?;
    Ok(())
}

#[test]
fn one_slow_relay_round_is_tolerated() -> Result<()> {
    init_tracing();
    let harness = Harness::new();
    let hook: PostCycleHook = Arc::new(|| thread::sleep(Duration::from_millis(150)));
    let pipeline = Pipeline::new(
        test_config(Duration::from_millis(100), 3),
        harness.hooks(Some(hook)),
    );
    pipeline.start()?;

    pipeline.feed().complete_cycle();
    assert!(wait_until(Duration::from_secs(5), || {
        pipeline.telemetry().post_cycle_callbacks() == 1
    }));
    thread::sleep(Duration::from_millis(400));

    assert!(harness.recorder.errors().is_empty());
    assert_eq!(pipeline.relay_probe().consecutive_stalls(), 0);

    pipeline.stop()?;
    Ok(())
}

#[test]
fn relay_stuck_for_tolerated_rounds_escalates() -> Result<()> {
    init_tracing();
    let harness = Harness::new();
    let gate = Arc::new(Gate::default());
    let hook: PostCycleHook = {
        let gate = Arc::clone(&gate);
        Arc::new(move || gate.wait())
    };
    let pipeline = Pipeline::new(
        test_config(Duration::from_millis(100), 3),
        harness.hooks(Some(hook)),
    );
    pipeline.start()?;

    pipeline.feed().complete_cycle();
    let escalated = wait_until(Duration::from_secs(5), || {
        !harness.recorder.errors().is_empty()
    });
    let stalls = pipeline.relay_probe().consecutive_stalls();
    gate.open();
    assert!(escalated, "stuck relay was never reported");

    let error = &harness.recorder.errors()[0];
    assert_eq!(error.worker(), WorkerKind::Relay);
    assert!(
        error
            .message()
            .starts_with("relay worker timed out while targeting post-cycle hook@"),
        "got {}",
        error.message()
    );
    assert_eq!(
        error.thread().and_then(|thread| thread.name()),
        Some("RelayWorker")
    );
    assert_eq!(stalls, 3);
    assert_eq!(pipeline.telemetry().snapshot().relay_stall_rounds, 3);

    pipeline.stop()?;
    Ok(())
}
