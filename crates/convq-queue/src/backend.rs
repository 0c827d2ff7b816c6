//! Queue Backend Trait

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::handler::JobHandler;
use crate::job::{BackendKind, CleanReport, JobId, JobOptions, JobSnapshot, QueueStats};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Backend error: {0}")]
    Backend(String),
    #[error("Durable broker unavailable: {0}")]
    BackendUnavailable(String),
    #[error("A worker is already registered on this queue")]
    WorkerAlreadyRegistered,
    #[error("Queue is closed")]
    Closed,
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<redis::RedisError> for QueueError {
    fn from(e: redis::RedisError) -> Self {
        Self::Backend(e.to_string())
    }
}

/// Operations every backend provides with identical observable behavior
#[async_trait]
pub trait QueueBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Enqueue a job and return immediately with its id
    async fn add_job(
        &self,
        job_type: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Result<JobId, QueueError>;

    /// Snapshot of a job, `None` when unknown or expired
    async fn get_job(&self, id: &JobId) -> Result<Option<JobSnapshot>, QueueError>;

    async fn stats(&self) -> Result<QueueStats, QueueError>;

    /// Attach the handler that executes jobs. Only one may be registered.
    async fn register_worker(&self, handler: Arc<dyn JobHandler>) -> Result<(), QueueError>;

    /// Most recently failed jobs, newest first
    async fn list_failed(&self, limit: usize) -> Result<Vec<JobSnapshot>, QueueError>;

    /// Drop finished jobs older than `grace`
    async fn clean(&self, grace: Duration) -> Result<CleanReport, QueueError>;

    /// Round-trip latency to the backing store
    async fn ping(&self) -> Result<Duration, QueueError> {
        Ok(Duration::ZERO)
    }

    /// Release workers, timers and connections
    async fn close(&self) -> Result<(), QueueError>;
}
