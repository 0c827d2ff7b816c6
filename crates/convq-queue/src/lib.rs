//! # convq queue
//!
//! Job queue for file conversion with two interchangeable backends.
//!
//! Features:
//! - Redis broker with atomic Lua transitions, lock renewal and stall recovery
//! - In-process fallback with the same observable behavior
//! - Priority scheduling, bounded concurrency and backoff between attempts
//! - Lifecycle events, metrics hooks and a health monitor

pub mod backend;
pub mod broker;
pub mod config;
pub mod events;
pub mod handler;
pub mod job;
pub mod manager;
pub mod memory;
pub mod metrics;
pub mod monitor;

pub use backend::{QueueBackend, QueueError};
pub use broker::RedisQueue;
pub use config::{BrokerConfig, ConfigError, MemoryConfig, QueueConfig};
pub use events::{EventBus, QueueEvent};
pub use handler::{FnHandler, JobContext, JobHandler, ProgressSink};
pub use job::{
    BackendKind, BackoffPolicy, CleanReport, ErrorCode, JobError, JobId, JobLookup, JobOptions,
    JobSnapshot, JobState, QueueInfo, QueueStats, MAX_PRIORITY,
};
pub use manager::QueueManager;
pub use memory::MemoryQueue;
pub use metrics::{MetricsSink, MetricsSnapshot, NoopMetrics, Outcome, QueueMetrics};
pub use monitor::{HealthSample, QueueMonitor};
