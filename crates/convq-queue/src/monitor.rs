//! Periodic queue health sampling

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::QueueError;
use crate::job::QueueStats;
use crate::manager::QueueManager;
use crate::metrics::MetricsSink;

/// One health sample
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSample {
    pub stats: QueueStats,
    /// Round trip to the broker; zero for the in-process backend
    pub latency_ms: u64,
}

/// Take a single sample and push the depth gauges into `metrics`.
pub async fn sample(
    manager: &QueueManager,
    metrics: &dyn MetricsSink,
) -> Result<HealthSample, QueueError> {
    let stats = manager.get_stats().await?;
    let latency = manager.ping().await?;
    metrics.record_queue_depth(&stats);
    Ok(HealthSample {
        stats,
        latency_ms: latency.as_millis() as u64,
    })
}

/// Background task sampling queue depth on a fixed interval
pub struct QueueMonitor {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl QueueMonitor {
    pub fn spawn(
        manager: Arc<QueueManager>,
        metrics: Arc<dyn MetricsSink>,
        interval: Duration,
    ) -> Self {
        let (stop, mut stopped) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut last_failed = None;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stopped.changed() => break,
                }

                match sample(&manager, metrics.as_ref()).await {
                    Ok(health) => {
                        let stats = &health.stats;
                        info!(
                            backend = %stats.backend,
                            waiting = stats.waiting,
                            active = stats.active,
                            completed = stats.completed,
                            failed = stats.failed,
                            latency_ms = health.latency_ms,
                            "Queue status"
                        );
                        if let Some(previous) = last_failed {
                            if stats.failed > previous {
                                warn!(new_failures = stats.failed - previous, "Jobs failed since last sample");
                            }
                        }
                        last_failed = Some(stats.failed);
                    }
                    Err(QueueError::Closed) => break,
                    Err(e) => warn!(error = %e, "Queue health sample failed"),
                }
            }

            debug!("Queue monitor stopped");
        });

        Self { stop, task }
    }

    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Queue monitor ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::job::{BackendKind, JobOptions};
    use crate::metrics::QueueMetrics;
    use serde_json::json;

    #[tokio::test]
    async fn test_sample_updates_gauges() {
        let manager = QueueManager::new(QueueConfig::in_memory());
        manager
            .add_job("convert-mpp-to-xml", json!({}), JobOptions::default())
            .await
            .unwrap();

        let metrics = QueueMetrics::new();
        let health = sample(&manager, &metrics).await.unwrap();

        assert_eq!(health.stats.backend, BackendKind::Memory);
        assert_eq!(health.stats.waiting, 1);
        assert_eq!(health.latency_ms, 0);
        assert_eq!(metrics.snapshot().queue_waiting, 1);
    }

    #[tokio::test]
    async fn test_monitor_stops() {
        let manager = Arc::new(QueueManager::new(QueueConfig::in_memory()));
        let metrics = Arc::new(QueueMetrics::new());
        let monitor = QueueMonitor::spawn(manager, metrics.clone(), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(30)).await;
        monitor.stop().await;
    }
}
