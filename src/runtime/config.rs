use crate::runtime::telemetry;
use anyhow::{bail, Context, Result};
use std::env;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_CLEANUP_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_WAKEUPS_PER_TIMEOUT: u32 = 5;
const DEFAULT_TOLERATED_RELAY_STALLS: u32 = 5;
const DEFAULT_DUMP_FLUSH_DELAY_MS: u64 = 5_000;

pub const ENV_TIMEOUT_MS: &str = "CLEANUPD_TIMEOUT_MS";
pub const ENV_WATCHDOG_WAKEUPS: &str = "CLEANUPD_WATCHDOG_WAKEUPS";
pub const ENV_TOLERATED_RELAY_STALLS: &str = "CLEANUPD_TOLERATED_RELAY_STALLS";
pub const ENV_DUMP_FLUSH_MS: &str = "CLEANUPD_DUMP_FLUSH_MS";

/// Runtime configuration for the cleanup pipeline and its watchdog.
///
/// All instances must be constructed via [`PipelineConfig::builder`] or [`PipelineConfig::new`]
/// so invariants are validated before any worker observes the values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    cleanup_timeout: Duration,
    wakeups_per_timeout: u32,
    tolerated_relay_stalls: u32,
    dump_flush_delay: Duration,
    metrics_interval: Duration,
}

pub struct PipelineConfigParams {
    pub cleanup_timeout: Duration,
    pub wakeups_per_timeout: u32,
    pub tolerated_relay_stalls: u32,
    pub dump_flush_delay: Duration,
    pub metrics_interval: Duration,
}

impl Default for PipelineConfigParams {
    fn default() -> Self {
        Self {
            cleanup_timeout: Duration::from_millis(DEFAULT_CLEANUP_TIMEOUT_MS),
            wakeups_per_timeout: DEFAULT_WAKEUPS_PER_TIMEOUT,
            tolerated_relay_stalls: DEFAULT_TOLERATED_RELAY_STALLS,
            dump_flush_delay: Duration::from_millis(DEFAULT_DUMP_FLUSH_DELAY_MS),
            metrics_interval: telemetry::DEFAULT_METRICS_INTERVAL,
        }
    }
}

impl PipelineConfig {
    /// Returns a builder to incrementally construct and validate a configuration.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::default()
    }

    /// Constructs a configuration directly from the provided values.
    pub fn new(params: PipelineConfigParams) -> Result<Self> {
        let PipelineConfigParams {
            cleanup_timeout,
            wakeups_per_timeout,
            tolerated_relay_stalls,
            dump_flush_delay,
            metrics_interval,
        } = params;

        let config = Self {
            cleanup_timeout,
            wakeups_per_timeout,
            tolerated_relay_stalls,
            dump_flush_delay,
            metrics_interval,
        };

        config.validate()?;
        Ok(config)
    }

    /// Stall window: how long an active worker may go without progress.
    pub fn cleanup_timeout(&self) -> Duration {
        self.cleanup_timeout
    }

    /// Number of sub-intervals the watchdog splits each window into.
    pub fn wakeups_per_timeout(&self) -> u32 {
        self.wakeups_per_timeout
    }

    /// Consecutive stalled rounds tolerated before the relay worker is reported.
    pub fn tolerated_relay_stalls(&self) -> u32 {
        self.tolerated_relay_stalls
    }

    /// Pause after requesting a stack dump, before the error is dispatched.
    pub fn dump_flush_delay(&self) -> Duration {
        self.dump_flush_delay
    }

    pub fn metrics_interval(&self) -> Duration {
        self.metrics_interval
    }

    /// Performs validation on an existing configuration instance.
    pub fn validate(&self) -> Result<()> {
        if self.cleanup_timeout.is_zero() {
            bail!("cleanup_timeout must be greater than 0");
        }

        if self.wakeups_per_timeout < 2 {
            bail!(
                "wakeups_per_timeout must be at least 2 (got {})",
                self.wakeups_per_timeout
            );
        }

        if self.tolerated_relay_stalls == 0 {
            bail!("tolerated_relay_stalls must be greater than 0");
        }

        if self.metrics_interval.is_zero() {
            bail!("metrics_interval must be greater than 0");
        }

        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct PipelineConfigBuilder {
    cleanup_timeout: Option<Duration>,
    wakeups_per_timeout: Option<u32>,
    tolerated_relay_stalls: Option<u32>,
    dump_flush_delay: Option<Duration>,
    metrics_interval: Option<Duration>,
}

impl PipelineConfigBuilder {
    /// Seeds a builder from the `CLEANUPD_*` environment variables.
    ///
    /// Unset variables keep their defaults; unparsable ones are an error.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key))
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Result<String, env::VarError>,
    {
        let mut builder = Self::default();
        if let Some(ms) = parse_var::<u64, _>(&lookup, ENV_TIMEOUT_MS)? {
            builder = builder.cleanup_timeout(Duration::from_millis(ms));
        }
        if let Some(wakeups) = parse_var::<u32, _>(&lookup, ENV_WATCHDOG_WAKEUPS)? {
            builder = builder.wakeups_per_timeout(wakeups);
        }
        if let Some(stalls) = parse_var::<u32, _>(&lookup, ENV_TOLERATED_RELAY_STALLS)? {
            builder = builder.tolerated_relay_stalls(stalls);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, ENV_DUMP_FLUSH_MS)? {
            builder = builder.dump_flush_delay(Duration::from_millis(ms));
        }
        Ok(builder)
    }

    pub fn cleanup_timeout(mut self, timeout: Duration) -> Self {
        self.cleanup_timeout = Some(timeout);
        self
    }

    pub fn wakeups_per_timeout(mut self, wakeups: u32) -> Self {
        self.wakeups_per_timeout = Some(wakeups);
        self
    }

    pub fn tolerated_relay_stalls(mut self, stalls: u32) -> Self {
        self.tolerated_relay_stalls = Some(stalls);
        self
    }

    pub fn dump_flush_delay(mut self, delay: Duration) -> Self {
        self.dump_flush_delay = Some(delay);
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = Some(interval);
        self
    }

    pub fn build(self) -> Result<PipelineConfig> {
        let defaults = PipelineConfigParams::default();
        let params = PipelineConfigParams {
            cleanup_timeout: self.cleanup_timeout.unwrap_or(defaults.cleanup_timeout),
            wakeups_per_timeout: self
                .wakeups_per_timeout
                .unwrap_or(defaults.wakeups_per_timeout),
            tolerated_relay_stalls: self
                .tolerated_relay_stalls
                .unwrap_or(defaults.tolerated_relay_stalls),
            dump_flush_delay: self.dump_flush_delay.unwrap_or(defaults.dump_flush_delay),
            metrics_interval: self.metrics_interval.unwrap_or(defaults.metrics_interval),
        };

        PipelineConfig::new(params).context("invalid cleanup pipeline configuration")
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Result<String, env::VarError>,
{
    match lookup(key) {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("failed to parse {key}='{value}'")),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err).with_context(|| format!("failed to read {key}")),
    }
}
