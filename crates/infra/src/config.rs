//! Runtime configuration loaded from environment variables.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::fault::FailureMode;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?} ({reason})")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Pipeline settings.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub env_name: String,
    pub listen_addr: SocketAddr,
    pub failure_mode: FailureMode,
    pub visibility_timeout: Duration,
    /// Receives before a message is moved to the dead-letter queue.
    pub max_receive_count: u32,
    pub worker_concurrency: usize,
    pub worker_batch_size: usize,
    pub worker_poll_interval: Duration,
    /// Upper bound on one message's processing.
    pub processing_deadline: Duration,
    /// How long the simulated slow downstream would take if not preempted.
    pub slow_downstream: Duration,
    pub ledger_ttl: chrono::Duration,
    pub database_url: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            env_name: "dev".to_string(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            failure_mode: FailureMode::None,
            visibility_timeout: Duration::from_secs(30),
            max_receive_count: 5,
            worker_concurrency: 4,
            worker_batch_size: 10,
            worker_poll_interval: Duration::from_millis(250),
            processing_deadline: Duration::from_secs(30),
            slow_downstream: Duration::from_secs(35),
            ledger_ttl: chrono::Duration::days(7),
            database_url: None,
        }
    }
}

impl PipelineConfig {
    /// Read from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read through `lookup`; unset or blank variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(v) = get("ENV_NAME") {
            config.env_name = v;
        }
        if let Some(v) = get("LISTEN_ADDR") {
            config.listen_addr = parse("LISTEN_ADDR", &v)?;
        }
        if let Some(v) = get("FAILURE_MODE") {
            config.failure_mode = FailureMode::from(v);
            if let FailureMode::Unknown(raw) = &config.failure_mode {
                warn!(failure_mode = %raw, "unknown FAILURE_MODE; no faults will be injected");
            }
        }
        if let Some(v) = get("QUEUE_VISIBILITY_TIMEOUT_SECS") {
            config.visibility_timeout = Duration::from_secs(parse("QUEUE_VISIBILITY_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = get("QUEUE_MAX_RECEIVE_COUNT") {
            config.max_receive_count = positive("QUEUE_MAX_RECEIVE_COUNT", &v)?;
        }
        if let Some(v) = get("WORKER_CONCURRENCY") {
            config.worker_concurrency = positive("WORKER_CONCURRENCY", &v)?;
        }
        if let Some(v) = get("WORKER_BATCH_SIZE") {
            config.worker_batch_size = positive("WORKER_BATCH_SIZE", &v)?;
        }
        if let Some(v) = get("WORKER_POLL_INTERVAL_MS") {
            config.worker_poll_interval = Duration::from_millis(parse("WORKER_POLL_INTERVAL_MS", &v)?);
        }
        if let Some(v) = get("PROCESSING_DEADLINE_SECS") {
            config.processing_deadline = Duration::from_secs(positive("PROCESSING_DEADLINE_SECS", &v)?);
        }
        if let Some(v) = get("SLOW_DOWNSTREAM_SECS") {
            config.slow_downstream = Duration::from_secs(parse("SLOW_DOWNSTREAM_SECS", &v)?);
        }
        if let Some(v) = get("LEDGER_TTL_DAYS") {
            config.ledger_ttl = chrono::Duration::days(positive("LEDGER_TTL_DAYS", &v)?);
        }
        config.database_url = get("DATABASE_URL");

        Ok(config)
    }
}

fn parse<T>(name: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        name,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn positive<T>(name: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default,
    T::Err: std::fmt::Display,
{
    let parsed: T = parse(name, value)?;
    if parsed <= T::default() {
        return Err(ConfigError::Invalid {
            name,
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(parsed)
}
