//! In-process queue with priority scheduling, bounded workers and retention
//!
//! Used whenever no broker is reachable. All job state lives in one
//! `RwLock<HashMap>`; every transition is applied under the write lock so a
//! reader never sees a half-updated record. Retry delays are stored on the
//! record as a "not eligible until" instant which the dispatcher filters on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::{watch, Notify, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backend::{QueueBackend, QueueError};
use crate::config::MemoryConfig;
use crate::events::{EventBus, QueueEvent};
use crate::handler::{JobContext, JobHandler, ProgressSink};
use crate::job::{
    BackendKind, CleanReport, ErrorCode, JobError, JobId, JobOptions, JobSnapshot, JobState,
    QueueStats,
};
use crate::metrics::{MetricsSink, NoopMetrics, Outcome};

#[derive(Debug, Clone)]
struct JobRecord {
    id: JobId,
    job_type: String,
    payload: Value,
    state: JobState,
    progress: u8,
    attempts: u32,
    max_attempts: u32,
    priority: i32,
    /// Creation order, breaks priority ties
    seq: u64,
    result: Option<Value>,
    error: Option<JobError>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    finished_on: Option<DateTime<Utc>>,
    /// Not eligible for selection before this instant
    run_at: Instant,
    started: Option<Instant>,
    /// Monotonic twin of `updated_at`, drives retention
    touched: Instant,
}

impl JobRecord {
    fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id.clone(),
            job_type: self.job_type.clone(),
            status: self.state,
            progress: self.progress,
            data: self.payload.clone(),
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            priority: self.priority,
            result: self.result.clone(),
            error: self.error.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            finished_on: self.finished_on,
            failed_reason: self.error.as_ref().map(|e| e.message.clone()),
            backend: BackendKind::Memory,
        }
    }

    fn expired(&self, now: Instant, retention: Duration) -> bool {
        self.state.is_terminal() && now.saturating_duration_since(self.touched) > retention
    }
}

/// Work handed from the dispatcher to a worker task
struct Claimed {
    id: JobId,
    job_type: String,
    payload: Value,
    attempt: u32,
    max_attempts: u32,
}

enum Claim {
    Job(Claimed),
    /// Nothing eligible; the earliest future `run_at`, if any
    Idle(Option<Instant>),
}

struct Shared {
    config: MemoryConfig,
    jobs: RwLock<HashMap<JobId, JobRecord>>,
    seq: AtomicU64,
    handler: OnceLock<Arc<dyn JobHandler>>,
    permits: Arc<Semaphore>,
    wake: Notify,
    shutdown: watch::Sender<bool>,
    events: EventBus,
    metrics: Arc<dyn MetricsSink>,
}

impl Shared {
    /// Select the best eligible job and move it to `processing` in one step.
    async fn claim_next(&self) -> Claim {
        let now = Instant::now();
        let mut jobs = self.jobs.write().await;

        let mut next_ready: Option<Instant> = None;
        let mut best: Option<((i32, Reverse<u64>), JobId)> = None;
        for job in jobs.values().filter(|j| j.state == JobState::Queued) {
            if job.run_at > now {
                next_ready = Some(next_ready.map_or(job.run_at, |t| t.min(job.run_at)));
                continue;
            }
            let key = (job.priority, Reverse(job.seq));
            if best.as_ref().map_or(true, |(k, _)| key > *k) {
                best = Some((key, job.id.clone()));
            }
        }

        let Some((_, id)) = best else {
            return Claim::Idle(next_ready);
        };
        let Some(job) = jobs.get_mut(&id) else {
            return Claim::Idle(next_ready);
        };

        job.state = JobState::Processing;
        job.attempts += 1;
        job.progress = 0;
        job.started = Some(now);
        job.touched = now;
        job.updated_at = Utc::now();

        Claim::Job(Claimed {
            id,
            job_type: job.job_type.clone(),
            payload: job.payload.clone(),
            attempt: job.attempts,
            max_attempts: job.max_attempts,
        })
    }

    /// Apply the outcome of one attempt.
    async fn finish(&self, id: &JobId, outcome: Result<Value, JobError>) {
        let now = Instant::now();
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(id) else {
            warn!(job_id = %id, "Finished job vanished from store");
            return;
        };

        let elapsed = job
            .started
            .map(|s| now.saturating_duration_since(s))
            .unwrap_or_default();
        job.touched = now;
        job.updated_at = Utc::now();

        let event = match outcome {
            Ok(result) => {
                job.state = JobState::Completed;
                job.result = Some(result.clone());
                job.error = None;
                job.finished_on = Some(job.updated_at);
                info!(job_id = %id, attempts = job.attempts, "Job completed");
                self.metrics
                    .record_outcome(Outcome::Completed, elapsed, None);
                QueueEvent::Completed {
                    id: id.clone(),
                    data: job.payload.clone(),
                    result,
                }
            }
            Err(err) if err.is_retryable() && job.attempts < job.max_attempts => {
                let delay = self.config.backoff.delay(job.attempts);
                job.state = JobState::Queued;
                job.run_at = now + delay;
                job.error = Some(err.clone());
                warn!(
                    job_id = %id,
                    attempt = job.attempts,
                    max_attempts = job.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Job failed, scheduling retry with backoff"
                );
                self.metrics.record_retry();
                QueueEvent::Retrying {
                    id: id.clone(),
                    attempt: job.attempts,
                    error: err,
                }
            }
            Err(err) => {
                job.state = JobState::Failed;
                job.error = Some(err.clone());
                job.finished_on = Some(job.updated_at);
                error!(job_id = %id, attempts = job.attempts, error = %err, "Job failed permanently");
                self.metrics
                    .record_outcome(Outcome::Failed, elapsed, Some(err.code));
                QueueEvent::Failed {
                    id: id.clone(),
                    error: err,
                }
            }
        };
        drop(jobs);

        self.events.emit(event);
    }

    async fn purge(&self, retention: Duration) -> CleanReport {
        let now = Instant::now();
        let mut report = CleanReport::default();
        self.jobs.write().await.retain(|_, job| {
            if !job.expired(now, retention) {
                return true;
            }
            match job.state {
                JobState::Completed => report.completed += 1,
                _ => report.failed += 1,
            }
            false
        });
        report
    }
}

struct MemoryProgress {
    shared: Arc<Shared>,
    id: JobId,
    attempt: u32,
}

#[async_trait]
impl ProgressSink for MemoryProgress {
    async fn report(&self, percent: u8) {
        let mut jobs = self.shared.jobs.write().await;
        if let Some(job) = jobs.get_mut(&self.id) {
            // stale reports from an earlier attempt are dropped
            if job.state == JobState::Processing
                && job.attempts == self.attempt
                && percent > job.progress
            {
                job.progress = percent;
                job.updated_at = Utc::now();
            }
        }
    }
}

/// In-process job store and scheduler
pub struct MemoryQueue {
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl MemoryQueue {
    /// Create a queue with its own event bus and no metrics.
    ///
    /// Spawns the dispatcher and retention sweep, so it must be called from
    /// within a tokio runtime.
    pub fn new(config: MemoryConfig) -> Self {
        Self::with_observers(config, EventBus::default(), Arc::new(NoopMetrics))
    }

    pub fn with_observers(
        config: MemoryConfig,
        events: EventBus,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let max_workers = config.max_workers.max(1);
        let (shutdown, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            config: MemoryConfig {
                max_workers,
                ..config
            },
            jobs: RwLock::new(HashMap::new()),
            seq: AtomicU64::new(0),
            handler: OnceLock::new(),
            permits: Arc::new(Semaphore::new(max_workers)),
            wake: Notify::new(),
            shutdown,
            events,
            metrics,
        });

        let tasks = vec![
            tokio::spawn(dispatch_loop(shared.clone())),
            tokio::spawn(sweep_loop(shared.clone())),
        ];

        info!(max_workers, "In-memory queue started");

        Self {
            shared,
            tasks: Mutex::new(tasks),
            closed: AtomicBool::new(false),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.shared.events
    }

    /// Run the retention sweep now. Returns how many jobs were dropped.
    pub async fn purge_expired(&self) -> CleanReport {
        self.shared.purge(self.shared.config.retention).await
    }

    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.closed.load(Ordering::Acquire) {
            Err(QueueError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn add_job(
        &self,
        job_type: &str,
        payload: Value,
        options: JobOptions,
    ) -> Result<JobId, QueueError> {
        self.ensure_open()?;

        let id = JobId::new(Uuid::new_v4().to_string());
        let now = Instant::now();
        let created_at = Utc::now();
        let record = JobRecord {
            id: id.clone(),
            job_type: job_type.to_string(),
            payload,
            state: JobState::Queued,
            progress: 0,
            attempts: 0,
            max_attempts: options
                .max_attempts
                .unwrap_or(self.shared.config.max_attempts)
                .max(1),
            priority: options.priority(),
            seq: self.shared.seq.fetch_add(1, Ordering::Relaxed),
            result: None,
            error: None,
            created_at,
            updated_at: created_at,
            finished_on: None,
            run_at: now + options.delay(),
            started: None,
            touched: now,
        };

        debug!(job_id = %id, job_type, priority = record.priority, "Job queued");
        self.shared.jobs.write().await.insert(id.clone(), record);
        self.shared.wake.notify_one();

        Ok(id)
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<JobSnapshot>, QueueError> {
        Ok(self.shared.jobs.read().await.get(id).map(JobRecord::snapshot))
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let now = Instant::now();
        let jobs = self.shared.jobs.read().await;

        let (mut waiting, mut delayed, mut active, mut completed, mut failed) = (0, 0, 0, 0, 0);
        for job in jobs.values() {
            match job.state {
                JobState::Queued => {
                    waiting += 1;
                    if job.run_at > now {
                        delayed += 1;
                    }
                }
                JobState::Processing => active += 1,
                JobState::Completed => completed += 1,
                JobState::Failed => failed += 1,
            }
        }

        let max_workers = self.shared.config.max_workers as u64;
        Ok(QueueStats::new(
            BackendKind::Memory,
            waiting,
            delayed,
            active,
            completed,
            failed,
            active,
            max_workers,
        ))
    }

    async fn register_worker(&self, handler: Arc<dyn JobHandler>) -> Result<(), QueueError> {
        self.ensure_open()?;
        self.shared
            .handler
            .set(handler)
            .map_err(|_| QueueError::WorkerAlreadyRegistered)?;
        info!(
            max_workers = self.shared.config.max_workers,
            "Memory worker registered"
        );
        self.shared.wake.notify_one();
        Ok(())
    }

    async fn list_failed(&self, limit: usize) -> Result<Vec<JobSnapshot>, QueueError> {
        let jobs = self.shared.jobs.read().await;
        let mut failed: Vec<JobSnapshot> = jobs
            .values()
            .filter(|j| j.state == JobState::Failed)
            .map(JobRecord::snapshot)
            .collect();
        failed.sort_by(|a, b| b.finished_on.cmp(&a.finished_on));
        failed.truncate(limit);
        Ok(failed)
    }

    async fn clean(&self, grace: Duration) -> Result<CleanReport, QueueError> {
        Ok(self.shared.purge(grace).await)
    }

    async fn close(&self) -> Result<(), QueueError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let _ = self.shared.shutdown.send(true);
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|p| p.into_inner()));
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Queue background task ended abnormally");
            }
        }

        // Give in-flight jobs a chance to finish
        let all = self.shared.config.max_workers as u32;
        match tokio::time::timeout(
            self.shared.config.shutdown_grace,
            self.shared.permits.acquire_many(all),
        )
        .await
        {
            Ok(_) => debug!("All in-flight jobs drained"),
            Err(_) => warn!(
                grace_ms = self.shared.config.shutdown_grace.as_millis() as u64,
                "Shutdown grace elapsed with jobs still running"
            ),
        }
        self.shared.permits.close();

        info!("In-memory queue closed");
        Ok(())
    }
}

impl Drop for MemoryQueue {
    fn drop(&mut self) {
        let _ = self.shared.shutdown.send(true);
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn dispatch_loop(shared: Arc<Shared>) {
    let mut shutdown = shared.shutdown.subscribe();

    loop {
        if *shutdown.borrow() {
            break;
        }

        let mut wake_at = None;
        if let Some(handler) = shared.handler.get().cloned() {
            if let Ok(permit) = shared.permits.clone().try_acquire_owned() {
                match shared.claim_next().await {
                    Claim::Job(claimed) => {
                        let shared = shared.clone();
                        tokio::spawn(async move {
                            run_attempt(shared.clone(), handler, claimed).await;
                            drop(permit);
                            shared.wake.notify_one();
                        });
                        continue;
                    }
                    Claim::Idle(next) => wake_at = next,
                }
            }
        }

        tokio::select! {
            _ = shared.wake.notified() => {}
            _ = sleep_until(wake_at) => {}
            _ = shutdown.changed() => {}
        }
    }

    debug!("Dispatcher stopped");
}

async fn run_attempt(shared: Arc<Shared>, handler: Arc<dyn JobHandler>, claimed: Claimed) {
    let Claimed {
        id,
        job_type,
        payload,
        attempt,
        max_attempts,
    } = claimed;

    debug!(job_id = %id, job_type = %job_type, attempt, "Processing job");

    let progress = Arc::new(MemoryProgress {
        shared: shared.clone(),
        id: id.clone(),
        attempt,
    });
    let ctx = JobContext::new(id.clone(), job_type, payload, attempt, max_attempts, progress);

    // A separate task keeps a panicking handler from taking the worker down
    let outcome = match tokio::spawn(async move { handler.handle(ctx).await }).await {
        Ok(outcome) => outcome,
        Err(e) if e.is_panic() => Err(JobError::new(ErrorCode::HandlerPanic, "handler panicked")),
        Err(e) => Err(JobError::new(ErrorCode::HandlerError, e.to_string())),
    };

    shared.finish(&id, outcome).await;
}

async fn sweep_loop(shared: Arc<Shared>) {
    let mut shutdown = shared.shutdown.subscribe();
    let mut ticker = tokio::time::interval(shared.config.sweep_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = shared.purge(shared.config.retention).await;
                if report.completed + report.failed > 0 {
                    debug!(completed = report.completed, failed = report.failed, "Expired jobs removed");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::FnHandler;
    use crate::job::MAX_PRIORITY;
    use serde_json::json;

    fn config(max_workers: usize) -> MemoryConfig {
        MemoryConfig {
            max_workers,
            ..MemoryConfig::default()
        }
    }

    #[tokio::test]
    async fn test_add_job_defaults() {
        let queue = MemoryQueue::new(config(2));
        let id = queue
            .add_job("convert-mpp-to-xml", json!({ "filename": "a.mpp" }), JobOptions::default())
            .await
            .unwrap();

        let job = queue.get_job(&id).await.unwrap().expect("job should exist");
        assert_eq!(job.status, JobState::Queued);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_attempts, 3);
        assert_eq!(job.priority, 0);
        assert_eq!(job.progress, 0);
        assert_eq!(job.backend, BackendKind::Memory);
        assert!(job.result.is_none());
        assert!(job.error.is_none());
    }

    #[tokio::test]
    async fn test_unknown_job_is_none() {
        let queue = MemoryQueue::new(config(1));
        assert!(queue.get_job(&JobId::from("nope")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_respects_priority_then_fifo() {
        let queue = MemoryQueue::new(config(1));
        let low = queue
            .add_job("t", json!({}), JobOptions::default().with_priority(1))
            .await
            .unwrap();
        let high = queue
            .add_job("t", json!({}), JobOptions::default().with_priority(5))
            .await
            .unwrap();
        let low2 = queue
            .add_job("t", json!({}), JobOptions::default().with_priority(1))
            .await
            .unwrap();

        let mut order = Vec::new();
        for _ in 0..3 {
            match queue.shared.claim_next().await {
                Claim::Job(c) => order.push(c.id),
                Claim::Idle(_) => panic!("expected a job"),
            }
        }
        assert_eq!(order, vec![high, low, low2]);
        assert!(matches!(queue.shared.claim_next().await, Claim::Idle(None)));
    }

    #[tokio::test]
    async fn test_extreme_priority_is_clamped() {
        let queue = MemoryQueue::new(config(1));
        let first = queue
            .add_job("t", json!({}), JobOptions::default().with_priority(i32::MAX))
            .await
            .unwrap();
        let second = queue
            .add_job("t", json!({}), JobOptions::default().with_priority(MAX_PRIORITY))
            .await
            .unwrap();

        let job = queue.get_job(&first).await.unwrap().unwrap();
        assert_eq!(job.priority, MAX_PRIORITY);

        // same clamped priority, so creation order decides
        match queue.shared.claim_next().await {
            Claim::Job(c) => assert_eq!(c.id, first),
            Claim::Idle(_) => panic!("expected a job"),
        }
        match queue.shared.claim_next().await {
            Claim::Job(c) => assert_eq!(c.id, second),
            Claim::Idle(_) => panic!("expected a job"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_job_not_eligible_until_run_at() {
        let queue = MemoryQueue::new(config(1));
        queue
            .add_job("t", json!({}), JobOptions::default().with_delay(Duration::from_secs(10)))
            .await
            .unwrap();

        match queue.shared.claim_next().await {
            Claim::Idle(Some(at)) => assert!(at > Instant::now()),
            _ => panic!("delayed job must not be claimable yet"),
        }
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.waiting, 1);
        assert_eq!(stats.delayed, 1);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(matches!(queue.shared.claim_next().await, Claim::Job(_)));
    }

    #[tokio::test]
    async fn test_claim_increments_attempts_and_marks_processing() {
        let queue = MemoryQueue::new(config(1));
        let id = queue.add_job("t", json!({}), JobOptions::default()).await.unwrap();

        let Claim::Job(claimed) = queue.shared.claim_next().await else {
            panic!("expected a job");
        };
        assert_eq!(claimed.attempt, 1);

        let job = queue.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobState::Processing);
        assert_eq!(job.attempts, 1);
        // a processing job is never handed out twice
        assert!(matches!(queue.shared.claim_next().await, Claim::Idle(None)));
    }

    #[tokio::test]
    async fn test_validation_error_is_not_retried() {
        let queue = MemoryQueue::new(config(1));
        let id = queue.add_job("t", json!({}), JobOptions::default()).await.unwrap();
        let _ = queue.shared.claim_next().await;

        queue
            .shared
            .finish(&id, Err(JobError::validation("empty file")))
            .await;

        let job = queue.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobState::Failed);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.error.unwrap().code, ErrorCode::ValidationError);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_is_monotonic_and_reset_per_attempt() {
        let queue = MemoryQueue::new(config(1));
        let id = queue.add_job("t", json!({}), JobOptions::default()).await.unwrap();
        let _ = queue.shared.claim_next().await;

        let sink = MemoryProgress {
            shared: queue.shared.clone(),
            id: id.clone(),
            attempt: 1,
        };
        sink.report(40).await;
        sink.report(20).await;
        assert_eq!(queue.get_job(&id).await.unwrap().unwrap().progress, 40);

        queue
            .shared
            .finish(&id, Err(JobError::conversion("boom")))
            .await;
        // stale sink from attempt 1 cannot touch the requeued job
        sink.report(90).await;
        assert_eq!(queue.get_job(&id).await.unwrap().unwrap().progress, 40);

        tokio::time::advance(Duration::from_secs(3)).await;
        let _ = queue.shared.claim_next().await;
        let job = queue.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.attempts, 2);
        assert_eq!(job.progress, 0);
    }

    #[tokio::test]
    async fn test_register_worker_twice_fails() {
        let queue = MemoryQueue::new(config(1));
        let handler = Arc::new(FnHandler(|_ctx: JobContext| async { Ok::<_, JobError>(json!(null)) }));
        queue.register_worker(handler.clone()).await.unwrap();
        assert!(matches!(
            queue.register_worker(handler).await,
            Err(QueueError::WorkerAlreadyRegistered)
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_rejects_new_jobs() {
        let queue = MemoryQueue::new(config(1));
        queue.close().await.unwrap();
        queue.close().await.unwrap();
        assert!(matches!(
            queue.add_job("t", json!({}), JobOptions::default()).await,
            Err(QueueError::Closed)
        ));
    }
}
