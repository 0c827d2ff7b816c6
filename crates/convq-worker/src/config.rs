//! Worker configuration

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use convq_queue::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Root of the incoming/processing/converted/quarantine tree
    pub upload_dir: PathBuf,
    /// Wall-clock limit for one conversion
    pub job_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            upload_dir: PathBuf::from("uploads"),
            job_timeout: Duration::from_millis(300_000),
        }
    }
}

impl WorkerConfig {
    /// Load from environment
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(dir) = env::var("UPLOAD_DIR") {
            config.upload_dir = PathBuf::from(dir);
        }
        if let Ok(value) = env::var("JOB_TIMEOUT_MS") {
            let parsed = value.trim().parse::<u64>().ok().filter(|ms| *ms > 0);
            let Some(ms) = parsed else {
                return Err(ConfigError::Invalid {
                    var: "JOB_TIMEOUT_MS".to_string(),
                    value,
                });
            };
            config.job_timeout = Duration::from_millis(ms);
        }

        Ok(config)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }
}
