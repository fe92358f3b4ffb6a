use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Condvar, Mutex,
};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use cleanupd::{
    Diagnostics, PipelineConfig, PipelineHooks, PostCycleHook, TimeoutError, UncaughtHandler,
};
use once_cell::sync::Lazy;
use tracing_subscriber::EnvFilter;

static TRACING_SUBSCRIBER: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
});

pub fn init_tracing() {
    Lazy::force(&TRACING_SUBSCRIBER);
}

/// Polls `condition` every few milliseconds until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(2));
    }
}

/// Counts stack dump requests instead of signalling the test process.
#[derive(Default)]
pub struct RecordingDiagnostics {
    dumps: AtomicUsize,
}

impl RecordingDiagnostics {
    pub fn dumps(&self) -> usize {
        self.dumps.load(Ordering::SeqCst)
    }
}

impl Diagnostics for RecordingDiagnostics {
    fn request_stack_dump(&self) -> Result<()> {
        self.dumps.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Collects escalated errors in place of the process exiting.
#[derive(Default)]
pub struct RecordingHandler {
    errors: Mutex<Vec<TimeoutError>>,
}

impl RecordingHandler {
    pub fn handler(self: &Arc<Self>) -> UncaughtHandler {
        let this = Arc::clone(self);
        Arc::new(move |error: &TimeoutError| this.errors.lock().unwrap().push(error.clone()))
    }

    pub fn errors(&self) -> Vec<TimeoutError> {
        self.errors.lock().unwrap().clone()
    }
}

/// One-shot gate that blocks cleanup actions or hooks until opened.
#[derive(Default)]
pub struct Gate {
    open: Mutex<bool>,
    opened: Condvar,
    entered: AtomicUsize,
}

impl Gate {
    pub fn wait(&self) {
        self.entered.fetch_add(1, Ordering::SeqCst);
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.opened.wait(open).unwrap();
        }
    }

    pub fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.opened.notify_all();
    }

    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }
}

pub struct Harness {
    pub diagnostics: Arc<RecordingDiagnostics>,
    pub recorder: Arc<RecordingHandler>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            diagnostics: Arc::new(RecordingDiagnostics::default()),
            recorder: Arc::new(RecordingHandler::default()),
        }
    }

    pub fn hooks(&self, post_cycle: Option<PostCycleHook>) -> PipelineHooks {
        PipelineHooks {
            post_cycle,
            diagnostics: self.diagnostics.clone(),
            uncaught: Some(self.recorder.handler()),
        }
    }
}

pub fn test_config(timeout: Duration, tolerated_relay_stalls: u32) -> PipelineConfig {
    PipelineConfig::builder()
        .cleanup_timeout(timeout)
        .wakeups_per_timeout(5)
        .tolerated_relay_stalls(tolerated_relay_stalls)
        .dump_flush_delay(Duration::ZERO)
        .metrics_interval(Duration::from_millis(50))
        .build()
        .expect("test config should build")
}
