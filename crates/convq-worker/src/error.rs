//! Worker error types

use std::time::Duration;

use convq_queue::{ErrorCode, JobError};

use crate::converter::ConversionError;

/// Failure of one processing attempt
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// Bad payload or input file; retrying cannot help
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Staging failed for {file}: {source}")]
    Staging {
        file: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Conversion exceeded {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("Conversion failed: {0}")]
    Conversion(#[from] ConversionError),
}

impl ProcessError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) => ErrorCode::ValidationError,
            Self::Timeout(_) => ErrorCode::JobTimeout,
            Self::Conversion(_) => ErrorCode::ConversionError,
            Self::Staging { .. } => ErrorCode::HandlerError,
        }
    }
}

impl From<ProcessError> for JobError {
    fn from(e: ProcessError) -> Self {
        let message = match &e {
            ProcessError::Validation(msg) => msg.clone(),
            ProcessError::Conversion(inner) => inner.to_string(),
            other => other.to_string(),
        };
        JobError::new(e.code(), message)
    }
}
