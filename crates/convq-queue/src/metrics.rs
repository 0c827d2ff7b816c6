//! Metrics for the queue core

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::job::{ErrorCode, QueueStats};

/// Terminal outcome of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Completed,
    Failed,
}

/// One-way notifications from the queue core. Implementations must not block
/// and must not panic; the core never looks at whether a report landed.
pub trait MetricsSink: Send + Sync {
    fn record_outcome(&self, outcome: Outcome, duration: Duration, error_code: Option<ErrorCode>);

    fn record_retry(&self);

    /// Queue depth sample, fed by the monitor
    fn record_queue_depth(&self, _stats: &QueueStats) {}
}

/// Sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_outcome(&self, _: Outcome, _: Duration, _: Option<ErrorCode>) {}

    fn record_retry(&self) {}
}

/// Counter-based metrics collector
#[derive(Debug, Default)]
pub struct QueueMetrics {
    pub jobs_completed: AtomicU64,
    pub jobs_failed: AtomicU64,
    pub jobs_retried: AtomicU64,
    pub timeouts: AtomicU64,
    pub validation_errors: AtomicU64,
    pub conversion_errors: AtomicU64,
    /// Sum of processing time over finished jobs, in milliseconds
    pub processing_ms_total: AtomicU64,
    pub queue_waiting: AtomicU64,
    pub queue_delayed: AtomicU64,
    pub queue_active: AtomicU64,
    pub queue_failed: AtomicU64,
}

impl QueueMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_retried: self.jobs_retried.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            validation_errors: self.validation_errors.load(Ordering::Relaxed),
            conversion_errors: self.conversion_errors.load(Ordering::Relaxed),
            processing_ms_total: self.processing_ms_total.load(Ordering::Relaxed),
            queue_waiting: self.queue_waiting.load(Ordering::Relaxed),
            queue_delayed: self.queue_delayed.load(Ordering::Relaxed),
            queue_active: self.queue_active.load(Ordering::Relaxed),
            queue_failed: self.queue_failed.load(Ordering::Relaxed),
        }
    }

    /// Share of finished jobs that failed
    pub fn failure_rate(&self) -> f64 {
        let failed = self.jobs_failed.load(Ordering::Relaxed);
        let total = failed + self.jobs_completed.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            failed as f64 / total as f64
        }
    }
}

impl MetricsSink for QueueMetrics {
    fn record_outcome(&self, outcome: Outcome, duration: Duration, error_code: Option<ErrorCode>) {
        match outcome {
            Outcome::Completed => self.jobs_completed.fetch_add(1, Ordering::Relaxed),
            Outcome::Failed => self.jobs_failed.fetch_add(1, Ordering::Relaxed),
        };
        self.processing_ms_total
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);

        match error_code {
            Some(ErrorCode::JobTimeout) => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
            }
            Some(ErrorCode::ValidationError) => {
                self.validation_errors.fetch_add(1, Ordering::Relaxed);
            }
            Some(ErrorCode::ConversionError) => {
                self.conversion_errors.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    fn record_retry(&self) {
        self.jobs_retried.fetch_add(1, Ordering::Relaxed);
    }

    fn record_queue_depth(&self, stats: &QueueStats) {
        self.queue_waiting.store(stats.waiting, Ordering::Relaxed);
        self.queue_delayed.store(stats.delayed, Ordering::Relaxed);
        self.queue_active.store(stats.active, Ordering::Relaxed);
        self.queue_failed.store(stats.failed, Ordering::Relaxed);
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_retried: u64,
    pub timeouts: u64,
    pub validation_errors: u64,
    pub conversion_errors: u64,
    pub processing_ms_total: u64,
    pub queue_waiting: u64,
    pub queue_delayed: u64,
    pub queue_active: u64,
    pub queue_failed: u64,
}

impl MetricsSnapshot {
    /// Export metrics in Prometheus text format
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP convq_jobs_total Finished conversion jobs by outcome\n");
        output.push_str("# TYPE convq_jobs_total counter\n");
        output.push_str(&format!(
            "convq_jobs_total{{outcome=\"completed\"}} {}\n",
            self.jobs_completed
        ));
        output.push_str(&format!(
            "convq_jobs_total{{outcome=\"failed\"}} {}\n",
            self.jobs_failed
        ));

        output.push_str("# HELP convq_job_retries_total Attempts that were scheduled for retry\n");
        output.push_str("# TYPE convq_job_retries_total counter\n");
        output.push_str(&format!("convq_job_retries_total {}\n", self.jobs_retried));

        output.push_str("# HELP convq_job_failures_total Terminal failures by error code\n");
        output.push_str("# TYPE convq_job_failures_total counter\n");
        for (code, value) in [
            (ErrorCode::JobTimeout, self.timeouts),
            (ErrorCode::ValidationError, self.validation_errors),
            (ErrorCode::ConversionError, self.conversion_errors),
        ] {
            output.push_str(&format!(
                "convq_job_failures_total{{code=\"{}\"}} {}\n",
                code, value
            ));
        }

        output.push_str("# HELP convq_processing_seconds_total Time spent on finished jobs\n");
        output.push_str("# TYPE convq_processing_seconds_total counter\n");
        output.push_str(&format!(
            "convq_processing_seconds_total {:.3}\n",
            self.processing_ms_total as f64 / 1000.0
        ));

        output.push_str("# HELP convq_queue_size Jobs per queue state at the last sample\n");
        output.push_str("# TYPE convq_queue_size gauge\n");
        for (state, value) in [
            ("waiting", self.queue_waiting),
            ("delayed", self.queue_delayed),
            ("active", self.queue_active),
            ("failed", self.queue_failed),
        ] {
            output.push_str(&format!(
                "convq_queue_size{{state=\"{}\"}} {}\n",
                state, value
            ));
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::BackendKind;

    #[test]
    fn test_record_outcomes() {
        let metrics = QueueMetrics::new();
        metrics.record_outcome(Outcome::Completed, Duration::from_millis(1500), None);
        metrics.record_outcome(
            Outcome::Failed,
            Duration::from_millis(500),
            Some(ErrorCode::JobTimeout),
        );
        metrics.record_retry();

        let snap = metrics.snapshot();
        assert_eq!(snap.jobs_completed, 1);
        assert_eq!(snap.jobs_failed, 1);
        assert_eq!(snap.jobs_retried, 1);
        assert_eq!(snap.timeouts, 1);
        assert_eq!(snap.processing_ms_total, 2000);
        assert!((metrics.failure_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = QueueMetrics::new();
        metrics.record_queue_depth(&QueueStats::new(BackendKind::Memory, 4, 1, 2, 0, 0, 2, 2));
        let text = metrics.snapshot().to_prometheus();
        assert!(text.contains("convq_queue_size{state=\"waiting\"} 4"));
        assert!(text.contains("convq_queue_size{state=\"active\"} 2"));
        assert!(text.contains("# TYPE convq_jobs_total counter"));
    }
}
