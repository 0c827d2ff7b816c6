//! Queue configuration
//!
//! Every setting has a default and an environment override.

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::job::BackoffPolicy;

/// Error types for configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value:?}")]
    Invalid { var: String, value: String },
}

/// In-process backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    pub max_workers: usize,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    /// How long finished jobs stay queryable
    pub retention: Duration,
    /// Interval of the finished-job sweep
    pub sweep_interval: Duration,
    /// How long `close` waits for in-flight jobs
    pub shutdown_grace: Duration,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_workers: 2,
            max_attempts: 3,
            backoff: BackoffPolicy::Linear {
                base: Duration::from_millis(2000),
            },
            retention: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Redis broker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub url: String,
    /// Upper bound for connect + PING during backend selection
    pub probe_timeout: Duration,
    pub concurrency: usize,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    /// Lock held by a consumer on an active job
    pub lock_duration: Duration,
    /// Renewal cadence, roughly half the lock
    pub lock_renew: Duration,
    /// Stall recoveries before a job is failed
    pub max_stalled: u32,
    /// Interval of the delayed-promotion / stall / retention pass
    pub maintenance_interval: Duration,
    pub poll_interval: Duration,
    /// Age after which finished jobs are dropped
    pub retention: Duration,
    /// Count caps on finished history, if any
    pub keep_completed: Option<usize>,
    pub keep_failed: Option<usize>,
    /// How long `close` waits for in-flight jobs
    pub shutdown_grace: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        let lock_duration = Duration::from_secs(30);
        Self {
            url: "redis://localhost:6379".to_string(),
            probe_timeout: Duration::from_secs(3),
            concurrency: 2,
            max_attempts: 3,
            backoff: BackoffPolicy::Exponential {
                base: Duration::from_millis(2000),
            },
            lock_duration,
            lock_renew: lock_duration / 2,
            max_stalled: 2,
            maintenance_interval: Duration::from_secs(5),
            poll_interval: Duration::from_millis(200),
            retention: Duration::from_secs(24 * 60 * 60),
            keep_completed: None,
            keep_failed: None,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Full queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Queue name, also the broker key namespace
    pub name: String,
    /// Skip broker probing and always run in-process
    pub force_memory: bool,
    pub memory: MemoryConfig,
    pub broker: BrokerConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "file-conversion".to_string(),
            force_memory: false,
            memory: MemoryConfig::default(),
            broker: BrokerConfig::default(),
        }
    }
}

impl QueueConfig {
    /// Configuration that never touches a broker
    pub fn in_memory() -> Self {
        Self {
            force_memory: true,
            ..Self::default()
        }
    }

    /// Load from environment
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(name) = env::var("QUEUE_NAME") {
            config.name = name;
        }
        if let Ok(url) = env::var("REDIS_URL") {
            config.broker.url = url;
        }
        config.force_memory = env::var("QUEUE_FORCE_MEMORY")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        if let Some(concurrency) = parse_var::<usize>("QUEUE_MAX_CONCURRENCY")? {
            let concurrency = concurrency.max(1);
            config.memory.max_workers = concurrency;
            config.broker.concurrency = concurrency;
        }
        if let Some(attempts) = parse_var::<u32>("QUEUE_MAX_ATTEMPTS")? {
            config.memory.max_attempts = attempts.max(1);
            config.broker.max_attempts = attempts.max(1);
        }
        if let Some(ms) = parse_var::<u64>("QUEUE_PROBE_TIMEOUT_MS")? {
            config.broker.probe_timeout = Duration::from_millis(ms.min(5000));
        }
        if let Some(hours) = parse_var::<u64>("QUEUE_RETENTION_HOURS")? {
            let retention = Duration::from_secs(hours * 60 * 60);
            config.memory.retention = retention;
            config.broker.retention = retention;
        }

        Ok(config)
    }

    /// Broker URL with any password replaced, safe for logs and `get_info`
    pub fn redacted_broker_url(&self) -> String {
        redact_url(&self.broker.url)
    }
}

pub(crate) fn parse_var<T: FromStr>(var: &str) -> Result<Option<T>, ConfigError> {
    match env::var(var) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid {
                var: var.to_string(),
                value,
            }),
        Err(_) => Ok(None),
    }
}

fn redact_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    match rest.rsplit_once('@') {
        Some((userinfo, host)) => {
            let user = userinfo.split(':').next().unwrap_or_default();
            if userinfo.contains(':') {
                format!("{scheme}://{user}:***@{host}")
            } else {
                format!("{scheme}://***@{host}")
            }
        }
        None => url.to_string(),
    }
}
