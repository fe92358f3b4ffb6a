use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::support::helpers::{init_tracing, test_config, wait_until, Harness};
use anyhow::{anyhow, Result};
use cleanupd::{CleanupItem, Pipeline};

#[test]
fn every_item_is_processed_in_fifo_order() -> Result<()> {
    init_tracing();
    let harness = Harness::new();
    let pipeline = Pipeline::new(test_config(Duration::from_secs(2), 5), harness.hooks(None));
    pipeline.start()?;

    let order = Arc::new(Mutex::new(Vec::new()));
    let item = |index: usize| {
        let order = Arc::clone(&order);
        CleanupItem::named_cleanable("ordered", move || {
            order.lock().unwrap().push(index);
            Ok(())
        })
    };

    let progress_before = pipeline.cleanup_probe().progress().get();
    for chunk in (0..200).collect::<Vec<_>>().chunks(25) {
        pipeline.feed().push_batch(chunk.iter().map(|&index| item(index)));
    }

    assert!(
        wait_until(Duration::from_secs(5), || order.lock().unwrap().len() == 200),
        "not every item was processed"
    );
    assert_eq!(*order.lock().unwrap(), (0..200).collect::<Vec<_>>());
    assert!(pipeline.cleanup_probe().progress().get() >= progress_before + 200);
    assert_eq!(pipeline.telemetry().items_processed(), 200);
    assert!(pipeline.pending().is_empty());

    pipeline.stop()?;
    Ok(())
}

#[test]
fn failing_action_does_not_block_the_ones_behind_it() -> Result<()> {
    init_tracing();
    let harness = Harness::new();
    let pipeline = Pipeline::new(test_config(Duration::from_secs(2), 5), harness.hooks(None));
    pipeline.start()?;

    let done = Arc::new(Mutex::new(Vec::new()));
    let record = |name: &'static str| {
        let done = Arc::clone(&done);
        CleanupItem::named_cleanable(name, move || {
            done.lock().unwrap().push(name);
            Ok(())
        })
    };

    pipeline.feed().push_batch(vec![
        CleanupItem::named_cleanable("A", || Err(anyhow!("cleanup refused"))),
        record("B"),
        CleanupItem::named_cleanable("panicky", || panic!("cleanup exploded")),
        record("C"),
    ]);

    assert!(wait_until(Duration::from_secs(5), || {
        pipeline.telemetry().items_processed() == 4
    }));
    assert_eq!(*done.lock().unwrap(), vec!["B", "C"]);
    assert_eq!(pipeline.telemetry().cleanup_failures(), 2);
    assert!(!pipeline.escalation().is_triggered());

    pipeline.stop()?;
    Ok(())
}

#[test]
fn objects_are_moved_into_their_finalizer() -> Result<()> {
    init_tracing();
    struct Handle {
        released: Arc<Mutex<Vec<u32>>>,
        fd: u32,
    }

    let harness = Harness::new();
    let pipeline = Pipeline::new(test_config(Duration::from_secs(2), 5), harness.hooks(None));
    pipeline.start()?;

    let released = Arc::new(Mutex::new(Vec::new()));
    for fd in [3, 4, 5] {
        let handle = Handle {
            released: Arc::clone(&released),
            fd,
        };
        pipeline.feed().push(CleanupItem::object(handle, |handle: Handle| {
            handle.released.lock().unwrap().push(handle.fd);
            Ok(())
        }));
    }
    pipeline.feed().complete_cycle();

    assert!(wait_until(Duration::from_secs(5), || released.lock().unwrap().len() == 3));
    assert_eq!(*released.lock().unwrap(), vec![3, 4, 5]);

    pipeline.stop()?;
    Ok(())
}
