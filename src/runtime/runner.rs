use crate::runtime::config::PipelineConfig;
use crate::runtime::pipeline::{Pipeline, PipelineHooks};
use crate::runtime::telemetry::spawn_metrics_reporter;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Drives a [`Pipeline`] from async code and handles OS signals for graceful shutdowns.
///
/// The daemons themselves run on dedicated threads; the runtime only hosts the
/// metrics reporter and the signal wait.
pub struct Runner {
    pipeline: Arc<Pipeline>,
    shutdown: CancellationToken,
    metrics: Option<(CancellationToken, JoinHandle<()>)>,
    started: bool,
}

impl Runner {
    pub fn new(config: PipelineConfig, hooks: PipelineHooks) -> Self {
        Self {
            pipeline: Arc::new(Pipeline::new(config, hooks)),
            shutdown: CancellationToken::new(),
            metrics: None,
            started: false,
        }
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Returns a clone of the root shutdown token so external callers can integrate
    /// with their own signal handlers or cancellation strategies.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Starts the daemon threads and the metrics reporter.
    pub async fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }

        let pipeline = Arc::clone(&self.pipeline);
        tokio::task::spawn_blocking(move || pipeline.start())
            .await
            .context("pipeline start task panicked")??;

        let metrics_shutdown = self.shutdown.child_token();
        let handle = spawn_metrics_reporter(
            Arc::clone(self.pipeline.telemetry()),
            Arc::clone(self.pipeline.pending()),
            metrics_shutdown.clone(),
            self.pipeline.config().metrics_interval(),
        );
        self.metrics = Some((metrics_shutdown, handle));
        self.started = true;
        Ok(())
    }

    /// Stops the metrics reporter and joins the daemon threads off the async runtime.
    pub async fn stop(&mut self) -> Result<()> {
        if !self.started {
            return Ok(());
        }

        if let Some((token, handle)) = self.metrics.take() {
            token.cancel();
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "metrics reporter ended abnormally");
            }
        }

        let pipeline = Arc::clone(&self.pipeline);
        tokio::task::spawn_blocking(move || pipeline.stop())
            .await
            .context("pipeline stop task panicked")??;
        self.started = false;
        Ok(())
    }

    /// Runs until a Ctrl-C (SIGINT) is received or the shutdown token is cancelled elsewhere.
    pub async fn run_until_ctrl_c(&mut self) -> Result<()> {
        self.start().await?;
        tracing::info!("runner started; waiting for Ctrl-C (SIGINT) to initiate shutdown");

        tokio::select! {
            _ = signal::ctrl_c() => {
                tracing::info!("Ctrl-C received; shutting down runner");
            }
            _ = self.shutdown.cancelled() => {
                tracing::info!("runner shutdown token cancelled");
            }
        }

        self.shutdown.cancel();
        self.stop().await
    }
}
