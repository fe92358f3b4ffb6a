use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use crate::support::helpers::{init_tracing, test_config, Harness};
use anyhow::{Context, Result};
use cleanupd::{CleanupItem, Runner};
use tokio::time::{sleep, timeout};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn runner_stops_when_token_is_cancelled() -> Result<()> {
    init_tracing();
    let harness = Harness::new();
    let mut runner = Runner::new(test_config(Duration::from_secs(2), 5), harness.hooks(None));
    let token = runner.cancellation_token();
    let pipeline = Arc::clone(runner.pipeline());

    let cleaned = Arc::new(AtomicUsize::new(0));
    let feeder = {
        let cleaned = Arc::clone(&cleaned);
        tokio::spawn(async move {
            sleep(Duration::from_millis(100)).await;
            for _ in 0..10 {
                let cleaned = Arc::clone(&cleaned);
                pipeline.feed().push(CleanupItem::cleanable(move || {
                    cleaned.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }));
            }
            while pipeline.telemetry().items_processed() < 10 {
                sleep(Duration::from_millis(5)).await;
            }
            token.cancel();
        })
    };

    timeout(Duration::from_secs(5), runner.run_until_ctrl_c())
        .await
        .context("runner should stop after cancellation")??;
    feeder.await?;

    assert_eq!(cleaned.load(Ordering::SeqCst), 10);
    assert!(!runner.pipeline().is_running());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_and_stop_are_idempotent() -> Result<()> {
    init_tracing();
    let harness = Harness::new();
    let mut runner = Runner::new(test_config(Duration::from_secs(2), 5), harness.hooks(None));

    runner.start().await?;
    runner.start().await?;
    assert!(runner.pipeline().is_running());

    runner.stop().await?;
    runner.stop().await?;
    assert!(!runner.pipeline().is_running());
    Ok(())
}
