//! Lifecycle events
//!
//! Both backends publish through the same [`EventBus`], so subscribers see
//! identical event shapes regardless of where jobs run. Events for one job are
//! sent from the task that finished it, in the order the outcomes happened.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::job::{BackendKind, JobError, JobId};

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    Ready {
        backend: BackendKind,
    },
    /// `data` is the job payload, `result` what the handler returned
    Completed {
        id: JobId,
        data: serde_json::Value,
        result: serde_json::Value,
    },
    /// Terminal failure
    Failed {
        id: JobId,
        error: JobError,
    },
    /// An attempt failed and another one is scheduled
    Retrying {
        id: JobId,
        attempt: u32,
        error: JobError,
    },
    Closed,
}

impl QueueEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ready { .. } => "ready",
            Self::Completed { .. } => "job:completed",
            Self::Failed { .. } => "job:failed",
            Self::Retrying { .. } => "job:retrying",
            Self::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<QueueEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: QueueEvent) {
        tracing::trace!(event = event.name(), "queue event");
        let _ = self.tx.send(event);
    }
}
