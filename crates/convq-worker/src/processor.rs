//! Conversion job processor
//!
//! Runs exactly one attempt of a conversion job:
//!
//! ```text
//! validating → staging-in → converting → staging-out → done
//!      └────────────┴────────────┴──→ quarantining → failed
//! ```
//!
//! Retrying is the queue's decision; the processor only reports how the
//! attempt ended.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use convq_queue::{JobContext, JobError, JobHandler};

use crate::config::WorkerConfig;
use crate::converter::{ConversionError, ConversionResult, ConverterRegistry, Route};
use crate::error::ProcessError;
use crate::staging::{exists, StagingArea};

/// Progress reported after each step
pub mod milestones {
    pub const VALIDATED: u8 = 10;
    pub const STAGED: u8 = 20;
    pub const CONVERTING: u8 = 40;
    pub const CONVERTED: u8 = 80;
    pub const DONE: u8 = 100;
}

/// Payload of a conversion job
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionPayload {
    /// Name of the file inside `incoming`
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploaded_at: Option<DateTime<Utc>>,
}

impl ConversionPayload {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            original_name: None,
            user_id: None,
            size: None,
            uploaded_at: None,
        }
    }
}

/// Result stored on a completed job
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionOutcome {
    pub success: bool,
    pub original_file: String,
    pub original_name: Option<String>,
    pub converted_file: String,
    pub output_size: u64,
    pub conversion: ConversionResult,
    pub completed_at: DateTime<Utc>,
}

pub struct ConversionProcessor {
    staging: StagingArea,
    registry: ConverterRegistry,
    timeout: Duration,
}

impl ConversionProcessor {
    pub fn new(config: &WorkerConfig, registry: ConverterRegistry) -> Self {
        Self {
            staging: StagingArea::new(&config.upload_dir),
            registry,
            timeout: config.job_timeout,
        }
    }

    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }

    /// Run one attempt. On failure any staged file ends up in quarantine.
    pub async fn process(&self, job: &JobContext) -> Result<ConversionOutcome, ProcessError> {
        let payload: ConversionPayload = serde_json::from_value(job.payload.clone())
            .map_err(|e| ProcessError::Validation(format!("invalid payload: {e}")))?;
        let route = self.registry.get(&job.job_type).ok_or_else(|| {
            ProcessError::Validation(format!("no converter for job type {}", job.job_type))
        })?;

        debug!(job_id = %job.id, file = %payload.filename, "Validating input");
        let source = self.validate(&payload.filename, route, job.attempt).await?;
        job.set_progress(milestones::VALIDATED).await;

        let staged = self.staging.processing().join(&payload.filename);
        tokio::fs::rename(&source, &staged)
            .await
            .map_err(|e| ProcessError::Staging {
                file: payload.filename.clone(),
                source: e,
            })?;
        debug!(job_id = %job.id, file = %payload.filename, "File moved to processing");
        job.set_progress(milestones::STAGED).await;

        match self.convert_staged(job, &payload, route, &staged).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.staging.quarantine_file(&payload.filename).await;
                Err(e)
            }
        }
    }

    /// Locate the input and check it. Returns the path to move from.
    async fn validate(
        &self,
        filename: &str,
        route: &Route,
        attempt: u32,
    ) -> Result<PathBuf, ProcessError> {
        if !is_plain_file_name(filename) {
            return Err(ProcessError::Validation(format!(
                "invalid file name: {filename:?}"
            )));
        }
        if !route.accepts(filename) {
            return Err(ProcessError::Validation(format!(
                "expected a .{} file, got {filename}",
                route.input_ext
            )));
        }

        let mut source = self.staging.incoming().join(filename);
        if !exists(&source).await && attempt > 1 {
            // an earlier attempt of this job left it in quarantine
            let quarantined = self.staging.quarantine().join(filename);
            if exists(&quarantined).await {
                debug!(file = filename, attempt, "Re-staging input from quarantine");
                source = quarantined;
            }
        }

        let metadata = tokio::fs::metadata(&source).await.map_err(|_| {
            ProcessError::Validation(format!("file not found in incoming: {filename}"))
        })?;
        if !metadata.is_file() {
            return Err(ProcessError::Validation(format!(
                "not a regular file: {filename}"
            )));
        }
        if metadata.len() == 0 {
            return Err(ProcessError::Validation(format!("file is empty: {filename}")));
        }

        Ok(source)
    }

    async fn convert_staged(
        &self,
        job: &JobContext,
        payload: &ConversionPayload,
        route: &Route,
        staged: &Path,
    ) -> Result<ConversionOutcome, ProcessError> {
        let converted_name = route.output_name(&payload.filename);
        let output = self.staging.converted().join(&converted_name);

        job.set_progress(milestones::CONVERTING).await;
        info!(
            job_id = %job.id,
            file = %payload.filename,
            converter = route.converter.name(),
            "Starting conversion"
        );

        let conversion = self.run_with_timeout(route, staged, &output).await?;
        job.set_progress(milestones::CONVERTED).await;

        let output_size = tokio::fs::metadata(&output)
            .await
            .map_err(|_| {
                ProcessError::Conversion(ConversionError::Failed(format!(
                    "converter produced no output file {converted_name}"
                )))
            })?
            .len();

        if let Err(e) = tokio::fs::remove_file(staged).await {
            warn!(job_id = %job.id, file = %payload.filename, error = %e, "Failed to remove processed input");
        }
        job.set_progress(milestones::DONE).await;

        info!(
            job_id = %job.id,
            file = %payload.filename,
            converted = %converted_name,
            output_size,
            duration_ms = conversion.duration_ms,
            "Conversion finished"
        );

        Ok(ConversionOutcome {
            success: true,
            original_file: payload.filename.clone(),
            original_name: payload.original_name.clone(),
            converted_file: converted_name,
            output_size,
            conversion,
            completed_at: Utc::now(),
        })
    }

    /// Race the converter against the deadline. The converter runs in its own
    /// task so a hung conversion can be abandoned.
    async fn run_with_timeout(
        &self,
        route: &Route,
        input: &Path,
        output: &Path,
    ) -> Result<ConversionResult, ProcessError> {
        let converter = route.converter.clone();
        let (input, output) = (input.to_path_buf(), output.to_path_buf());
        let mut task = tokio::spawn(async move { converter.convert(&input, &output).await });

        match tokio::time::timeout(self.timeout, &mut task).await {
            Ok(Ok(result)) => Ok(result?),
            Ok(Err(e)) if e.is_panic() => Err(ConversionError::Failed("converter panicked".into()).into()),
            Ok(Err(e)) => Err(ConversionError::Failed(e.to_string()).into()),
            Err(_) => {
                task.abort();
                error!(timeout_ms = self.timeout.as_millis() as u64, "Conversion timed out");
                Err(ProcessError::Timeout(self.timeout))
            }
        }
    }
}

#[async_trait]
impl JobHandler for ConversionProcessor {
    async fn handle(&self, job: JobContext) -> Result<Value, JobError> {
        match self.process(&job).await {
            Ok(outcome) => serde_json::to_value(outcome)
                .map_err(|e| JobError::new(convq_queue::ErrorCode::HandlerError, e.to_string())),
            Err(e) => {
                let err = JobError::from(e);
                if err.is_retryable() && !job.is_last_attempt() {
                    warn!(job_id = %job.id, attempt = job.attempt, error = %err, "Conversion attempt failed");
                } else {
                    error!(job_id = %job.id, attempt = job.attempt, error = %err, "Conversion job failed permanently");
                }
                Err(err)
            }
        }
    }
}

/// A bare file name: no separators, no parent references
fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
        && Path::new(name).file_name().is_some_and(|n| n == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_file_names() {
        assert!(is_plain_file_name("a.mpp"));
        assert!(is_plain_file_name("1234-plan.mpp"));
        assert!(!is_plain_file_name(""));
        assert!(!is_plain_file_name(".."));
        assert!(!is_plain_file_name("../etc/passwd"));
        assert!(!is_plain_file_name("sub/a.mpp"));
        assert!(!is_plain_file_name("sub\\a.mpp"));
    }

    #[test]
    fn test_payload_shape() {
        let payload: ConversionPayload = serde_json::from_value(serde_json::json!({
            "filename": "a.mpp",
            "originalName": "Plan.mpp",
            "userId": "anonymous",
            "size": 12
        }))
        .unwrap();
        assert_eq!(payload.filename, "a.mpp");
        assert_eq!(payload.original_name.as_deref(), Some("Plan.mpp"));
        assert_eq!(payload.size, Some(12));
    }
}
