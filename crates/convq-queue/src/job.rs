//! Job definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Opaque job identifier.
///
/// The in-process backend hands out UUIDs, the broker hands out its own
/// sequence numbers. Callers must never assume either format.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Canonical job state, identical across backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Waiting in queue (possibly not yet eligible because of a retry delay)
    Queued,
    /// Currently being processed
    Processing,
    /// Successfully completed
    Completed,
    /// Permanently failed
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Translate a broker-native state name into the canonical vocabulary.
    pub fn from_native(native: &str) -> Option<Self> {
        match native {
            "waiting" | "delayed" | "prioritized" | "paused" => Some(Self::Queued),
            "active" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry backoff policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackoffPolicy {
    /// Same delay before every retry
    Fixed {
        #[serde(with = "millis")]
        delay: Duration,
    },
    /// `base * attempts`
    Linear {
        #[serde(with = "millis")]
        base: Duration,
    },
    /// `base * 2^(attempts - 1)`
    Exponential {
        #[serde(with = "millis")]
        base: Duration,
    },
}

impl BackoffPolicy {
    /// Delay before the retry that follows failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self {
            Self::Fixed { delay } => *delay,
            Self::Linear { base } => base.saturating_mul(attempt),
            Self::Exponential { base } => {
                let factor = 2_u32.saturating_pow((attempt - 1).min(20));
                base.saturating_mul(factor)
            }
        }
    }

    /// Name used by the broker scripts
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::Fixed { .. } => "fixed",
            Self::Linear { .. } => "linear",
            Self::Exponential { .. } => "exponential",
        }
    }

    pub(crate) fn base(&self) -> Duration {
        match self {
            Self::Fixed { delay } => *delay,
            Self::Linear { base } | Self::Exponential { base } => *base,
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Largest accepted priority magnitude. Values outside
/// `-MAX_PRIORITY..=MAX_PRIORITY` are clamped when the job is added.
pub const MAX_PRIORITY: i32 = 1_000_000;

/// Per-job options accepted by `add_job`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOptions {
    /// Higher runs first among eligible queued jobs; clamped to [`MAX_PRIORITY`]
    pub priority: Option<i32>,
    /// Attempt ceiling (backend default: 3)
    pub max_attempts: Option<u32>,
    /// Initial delay before the job becomes eligible
    pub delay_ms: Option<u64>,
}

impl JobOptions {
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_ms = Some(delay.as_millis() as u64);
        self
    }

    pub(crate) fn priority(&self) -> i32 {
        self.priority
            .unwrap_or(0)
            .clamp(-MAX_PRIORITY, MAX_PRIORITY)
    }

    pub(crate) fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms.unwrap_or(0))
    }
}

/// Machine-readable failure codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    JobTimeout,
    ConversionError,
    BackendUnavailable,
    NotFound,
    JobStalled,
    HandlerPanic,
    HandlerError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationError => "VALIDATION_ERROR",
            Self::JobTimeout => "JOB_TIMEOUT",
            Self::ConversionError => "CONVERSION_ERROR",
            Self::BackendUnavailable => "BACKEND_UNAVAILABLE",
            Self::NotFound => "NOT_FOUND",
            Self::JobStalled => "JOB_STALLED",
            Self::HandlerPanic => "HANDLER_PANIC",
            Self::HandlerError => "HANDLER_ERROR",
        }
    }

    pub fn parse(code: &str) -> Option<Self> {
        Some(match code {
            "VALIDATION_ERROR" => Self::ValidationError,
            "JOB_TIMEOUT" => Self::JobTimeout,
            "CONVERSION_ERROR" => Self::ConversionError,
            "BACKEND_UNAVAILABLE" => Self::BackendUnavailable,
            "NOT_FOUND" => Self::NotFound,
            "JOB_STALLED" => Self::JobStalled,
            "HANDLER_PANIC" => Self::HandlerPanic,
            "HANDLER_ERROR" => Self::HandlerError,
            _ => return None,
        })
    }

    /// Whether a failure with this code may be retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::ValidationError | Self::NotFound)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a single attempt, as reported by a handler and retained on the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct JobError {
    pub code: ErrorCode,
    pub message: String,
}

impl JobError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::JobTimeout, message)
    }

    pub fn conversion(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConversionError, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }
}

/// Which backend serves the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Memory,
    Broker,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Broker => "broker",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only view of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub id: JobId,
    #[serde(rename = "type")]
    pub job_type: String,
    pub status: JobState,
    pub progress: u8,
    pub data: serde_json::Value,
    pub attempts: u32,
    pub max_attempts: u32,
    pub priority: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_on: Option<DateTime<Utc>>,
    pub failed_reason: Option<String>,
    pub backend: BackendKind,
}

/// Outcome of a status query
#[derive(Debug, Clone, PartialEq)]
pub enum JobLookup {
    Found(Box<JobSnapshot>),
    /// Unknown id, or a finished job that aged out of retention
    NotFound,
}

impl JobLookup {
    pub fn found(&self) -> Option<&JobSnapshot> {
        match self {
            Self::Found(job) => Some(job),
            Self::NotFound => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

impl From<Option<JobSnapshot>> for JobLookup {
    fn from(job: Option<JobSnapshot>) -> Self {
        match job {
            Some(job) => Self::Found(Box::new(job)),
            None => Self::NotFound,
        }
    }
}

impl Serialize for JobLookup {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        match self {
            Self::Found(job) => job.serialize(serializer),
            Self::NotFound => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("status", "not_found")?;
                map.end()
            }
        }
    }
}

/// Aggregate queue counts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub backend: BackendKind,
    /// Queued jobs, including those still inside a retry or start delay
    pub waiting: u64,
    /// Subset of `waiting` that is not yet eligible
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub total: u64,
    pub active_workers: u64,
    pub max_workers: u64,
}

impl QueueStats {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        backend: BackendKind,
        waiting: u64,
        delayed: u64,
        active: u64,
        completed: u64,
        failed: u64,
        active_workers: u64,
        max_workers: u64,
    ) -> Self {
        Self {
            backend,
            waiting,
            delayed,
            active,
            completed,
            failed,
            total: waiting + active + completed + failed,
            active_workers,
            max_workers,
        }
    }
}

/// Synchronous backend description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueInfo {
    pub backend: Option<BackendKind>,
    pub ready: bool,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broker_url: Option<String>,
}

/// Result of a history sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanReport {
    pub completed: u64,
    pub failed: u64,
}
