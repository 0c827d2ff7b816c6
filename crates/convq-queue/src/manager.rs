//! Backend selection and the public queue surface

use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, OnceCell};
use tracing::{info, warn};

use crate::backend::{QueueBackend, QueueError};
use crate::broker::RedisQueue;
use crate::config::QueueConfig;
use crate::events::{EventBus, QueueEvent};
use crate::handler::JobHandler;
use crate::job::{
    BackendKind, CleanReport, JobId, JobLookup, JobOptions, JobSnapshot, QueueInfo, QueueStats,
};
use crate::memory::MemoryQueue;
use crate::metrics::{MetricsSink, NoopMetrics};

/// Owns exactly one backend for the lifetime of the process.
///
/// The backend is chosen lazily on first use: the Redis broker if it answers
/// the probe, the in-process queue otherwise. The choice never changes
/// afterwards, and callers never see which one is in use except through
/// [`QueueManager::get_info`].
pub struct QueueManager {
    config: QueueConfig,
    backend: OnceCell<Arc<dyn QueueBackend>>,
    /// Held for the whole of a backend selection, and by `close`
    lifecycle: Mutex<()>,
    events: EventBus,
    metrics: Arc<dyn MetricsSink>,
    closed: AtomicBool,
}

impl QueueManager {
    pub fn new(config: QueueConfig) -> Self {
        Self::with_metrics(config, Arc::new(NoopMetrics))
    }

    pub fn with_metrics(config: QueueConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            config,
            backend: OnceCell::new(),
            lifecycle: Mutex::new(()),
            events: EventBus::default(),
            metrics,
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Lifecycle events of whichever backend ends up selected.
    ///
    /// Subscribe before `init` to also receive `Ready`.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Select and start the backend. Concurrent callers share one attempt;
    /// later calls return the same backend. Fails with `Closed` once
    /// [`QueueManager::close`] has started.
    pub async fn init(&self) -> Result<Arc<dyn QueueBackend>, QueueError> {
        self.ensure_open()?;
        if let Some(backend) = self.backend.get() {
            return Ok(backend.clone());
        }

        let _selecting = self.lifecycle.lock().await;
        // close may have run while we waited for the lock
        self.ensure_open()?;
        Ok(self
            .backend
            .get_or_init(|| self.select_backend())
            .await
            .clone())
    }

    async fn select_backend(&self) -> Arc<dyn QueueBackend> {
        let backend: Arc<dyn QueueBackend> = if self.config.force_memory {
            info!("Force memory mode enabled");
            Arc::new(self.memory_backend())
        } else {
            match RedisQueue::connect_with_observers(
                &self.config.name,
                self.config.broker.clone(),
                self.events.clone(),
                self.metrics.clone(),
            )
            .await
            {
                Ok(queue) => {
                    info!(url = %self.config.redacted_broker_url(), "Using Redis broker");
                    Arc::new(queue)
                }
                Err(e) => {
                    warn!(error = %e, "Redis unavailable, falling back to in-memory queue");
                    Arc::new(self.memory_backend())
                }
            }
        };

        self.events.emit(QueueEvent::Ready {
            backend: backend.kind(),
        });
        backend
    }

    fn memory_backend(&self) -> MemoryQueue {
        MemoryQueue::with_observers(
            self.config.memory.clone(),
            self.events.clone(),
            self.metrics.clone(),
        )
    }

    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.closed.load(Ordering::Acquire) {
            Err(QueueError::Closed)
        } else {
            Ok(())
        }
    }

    async fn open_backend(&self) -> Result<Arc<dyn QueueBackend>, QueueError> {
        self.init().await
    }

    pub async fn add_job(
        &self,
        job_type: &str,
        payload: Value,
        options: JobOptions,
    ) -> Result<JobId, QueueError> {
        self.open_backend()
            .await?
            .add_job(job_type, payload, options)
            .await
    }

    pub async fn get_job_status(&self, id: &str) -> Result<JobLookup, QueueError> {
        let job = self.open_backend().await?.get_job(&JobId::from(id)).await?;
        Ok(job.into())
    }

    pub async fn get_stats(&self) -> Result<QueueStats, QueueError> {
        self.open_backend().await?.stats().await
    }

    pub async fn register_worker(&self, handler: Arc<dyn JobHandler>) -> Result<(), QueueError> {
        self.open_backend().await?.register_worker(handler).await
    }

    pub async fn list_failed(&self, limit: usize) -> Result<Vec<JobSnapshot>, QueueError> {
        self.open_backend().await?.list_failed(limit).await
    }

    pub async fn clean(&self, grace: Duration) -> Result<CleanReport, QueueError> {
        self.open_backend().await?.clean(grace).await
    }

    pub async fn ping(&self) -> Result<Duration, QueueError> {
        self.open_backend().await?.ping().await
    }

    /// Which backend is active, without triggering selection
    pub fn backend_kind(&self) -> Option<BackendKind> {
        self.backend.get().map(|b| b.kind())
    }

    pub fn get_info(&self) -> QueueInfo {
        let backend = self.backend_kind();
        QueueInfo {
            backend,
            ready: backend.is_some() && !self.closed.load(Ordering::Acquire),
            name: self.config.name.clone(),
            broker_url: (backend == Some(BackendKind::Broker))
                .then(|| self.config.redacted_broker_url()),
        }
    }

    /// Stop the backend. Safe to call repeatedly and before `init`.
    ///
    /// A selection already in flight is allowed to finish first so the
    /// backend it starts is torn down too.
    pub async fn close(&self) -> Result<(), QueueError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _selecting = self.lifecycle.lock().await;
        if let Some(backend) = self.backend.get() {
            backend.close().await?;
        }
        self.events.emit(QueueEvent::Closed);
        Ok(())
    }
}
