//! Job handler contract
//!
//! A backend hands each attempt to the registered [`JobHandler`] together with
//! a [`JobContext`]. The handler reports coarse progress through the context
//! and returns either a JSON result or a [`JobError`]. Retry decisions belong
//! to the backend, never to the handler.

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::job::{JobError, JobId};

/// Executes jobs handed out by a backend
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run one attempt of a job.
    async fn handle(&self, job: JobContext) -> Result<Value, JobError>;
}

/// Receives progress updates for one attempt
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report(&self, percent: u8);
}

/// Adapter so plain async closures can be registered as handlers.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Value, JobError>> + Send + 'static,
{
    async fn handle(&self, job: JobContext) -> Result<Value, JobError> {
        (self.0)(job).await
    }
}

/// Everything a handler gets to see about the attempt it is running
#[derive(Clone)]
pub struct JobContext {
    pub id: JobId,
    pub job_type: String,
    pub payload: Value,
    /// 1-based attempt number
    pub attempt: u32,
    pub max_attempts: u32,
    progress: Arc<dyn ProgressSink>,
}

impl JobContext {
    pub fn new(
        id: JobId,
        job_type: impl Into<String>,
        payload: Value,
        attempt: u32,
        max_attempts: u32,
        progress: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            id,
            job_type: job_type.into(),
            payload,
            attempt,
            max_attempts,
            progress,
        }
    }

    /// Report advisory progress. Values above 100 are clamped, lower values
    /// than the last report are ignored by the backend.
    pub async fn set_progress(&self, percent: u8) {
        self.progress.report(percent.min(100)).await;
    }

    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

impl fmt::Debug for JobContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("id", &self.id)
            .field("job_type", &self.job_type)
            .field("attempt", &self.attempt)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}
