//! Redis backend against a live broker.
//!
//! Every test returns early when nothing answers on `REDIS_URL`
//! (default `redis://localhost:6379`).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::broadcast;

use convq_queue::{
    BackendKind, BackoffPolicy, BrokerConfig, ErrorCode, EventBus, FnHandler, JobContext,
    JobError, JobId, JobOptions, JobState, MetricsSink, QueueBackend, QueueEvent, QueueMetrics,
    RedisQueue, MAX_PRIORITY,
};

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string())
}

fn config() -> BrokerConfig {
    BrokerConfig {
        url: redis_url(),
        probe_timeout: Duration::from_millis(500),
        concurrency: 1,
        backoff: BackoffPolicy::Fixed {
            delay: Duration::from_millis(50),
        },
        maintenance_interval: Duration::from_millis(50),
        poll_interval: Duration::from_millis(20),
        ..BrokerConfig::default()
    }
}

async fn connect(config: BrokerConfig) -> Option<RedisQueue> {
    connect_with_metrics(config, Arc::new(QueueMetrics::new()))
        .await
        .map(|(queue, _)| queue)
}

/// Connect under a fresh queue name; also returns the name for direct key access
async fn connect_with_metrics(
    config: BrokerConfig,
    metrics: Arc<QueueMetrics>,
) -> Option<(RedisQueue, String)> {
    let name = format!("test-{}", uuid::Uuid::new_v4());
    let connected = RedisQueue::connect_with_observers(
        &name,
        config,
        EventBus::default(),
        metrics as Arc<dyn MetricsSink>,
    )
    .await;
    match connected {
        Ok(queue) => Some((queue, name)),
        Err(e) => {
            eprintln!("skipping: no broker ({e})");
            None
        }
    }
}

/// Handler that never finishes within a test, so its lock is never settled
fn hanging_handler(calls: Arc<AtomicU32>) -> Arc<dyn convq_queue::JobHandler> {
    Arc::new(FnHandler(move |_ctx: JobContext| {
        calls.fetch_add(1, Ordering::SeqCst);
        async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, JobError>(Value::Null)
        }
    }))
}

async fn wait_terminal(rx: &mut broadcast::Receiver<QueueEvent>, id: &JobId) -> QueueEvent {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = rx.recv().await.expect("event bus closed");
            match &event {
                QueueEvent::Completed { id: done, .. } | QueueEvent::Failed { id: done, .. }
                    if done == id =>
                {
                    return event
                }
                _ => {}
            }
        }
    })
    .await
    .expect("job did not finish in time")
}

#[tokio::test]
async fn test_unreachable_broker_is_unavailable() {
    let config = BrokerConfig {
        url: "redis://127.0.0.1:1".to_string(),
        probe_timeout: Duration::from_millis(300),
        ..BrokerConfig::default()
    };
    let result = RedisQueue::connect("unreachable", config).await;
    assert!(matches!(
        result,
        Err(convq_queue::QueueError::BackendUnavailable(_))
    ));
}

#[tokio::test]
async fn test_add_and_get() {
    let Some(queue) = connect(config()).await else { return };

    let id = queue
        .add_job("convert-mpp-to-xml", json!({ "filename": "a.mpp" }), JobOptions::default())
        .await
        .unwrap();
    let job = queue.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobState::Queued);
    assert_eq!(job.job_type, "convert-mpp-to-xml");
    assert_eq!(job.data["filename"], "a.mpp");
    assert_eq!(job.attempts, 0);
    assert_eq!(job.max_attempts, 3);
    assert_eq!(job.backend, BackendKind::Broker);

    assert!(queue.get_job(&JobId::from("999999")).await.unwrap().is_none());

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.waiting, 1);
    assert_eq!(stats.total, 1);
    queue.close().await.unwrap();
}

#[tokio::test]
async fn test_completes_with_result() {
    let Some(queue) = connect(config()).await else { return };
    let mut events = queue.events().subscribe();

    queue
        .register_worker(Arc::new(FnHandler(|ctx: JobContext| async move {
            ctx.set_progress(50).await;
            Ok::<_, JobError>(json!({ "convertedFile": "a.xml" }))
        })))
        .await
        .unwrap();

    let id = queue
        .add_job("convert-mpp-to-xml", json!({ "filename": "a.mpp" }), JobOptions::default())
        .await
        .unwrap();
    let event = wait_terminal(&mut events, &id).await;
    let QueueEvent::Completed { data, result, .. } = event else {
        panic!("expected completion, got {event:?}");
    };
    assert_eq!(data["filename"], "a.mpp");
    assert_eq!(result["convertedFile"], "a.xml");

    let job = queue.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobState::Completed);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.progress, 50);
    assert_eq!(job.result.unwrap()["convertedFile"], "a.xml");
    queue.close().await.unwrap();
}

#[tokio::test]
async fn test_retries_then_fails() {
    let Some(queue) = connect(config()).await else { return };
    let mut events = queue.events().subscribe();
    let calls = Arc::new(AtomicU32::new(0));

    let counter = calls.clone();
    queue
        .register_worker(Arc::new(FnHandler(move |_ctx: JobContext| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<Value, _>(JobError::conversion("bad format")) }
        })))
        .await
        .unwrap();

    let id = queue.add_job("t", json!({}), JobOptions::default()).await.unwrap();
    let event = wait_terminal(&mut events, &id).await;
    assert!(matches!(event, QueueEvent::Failed { .. }));

    let job = queue.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobState::Failed);
    assert_eq!(job.attempts, 3);
    assert_eq!(job.error.unwrap().code, ErrorCode::ConversionError);
    assert_eq!(job.failed_reason.as_deref(), Some("bad format"));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let failed = queue.list_failed(10).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, id);
    queue.close().await.unwrap();
}

#[tokio::test]
async fn test_priority_order() {
    let Some(queue) = connect(config()).await else { return };
    let mut events = queue.events().subscribe();

    let mut ids = Vec::new();
    for priority in [1, 1, 5, 1, 1] {
        ids.push(
            queue
                .add_job("t", json!({}), JobOptions::default().with_priority(priority))
                .await
                .unwrap(),
        );
    }

    queue
        .register_worker(Arc::new(FnHandler(|_ctx: JobContext| async {
            Ok::<_, JobError>(Value::Null)
        })))
        .await
        .unwrap();

    let mut order = Vec::new();
    while order.len() < ids.len() {
        if let QueueEvent::Completed { id, .. } = events.recv().await.unwrap() {
            order.push(id);
        }
    }
    assert_eq!(order[0], ids[2]);
    assert_eq!(&order[1..], &[ids[0].clone(), ids[1].clone(), ids[3].clone(), ids[4].clone()]);
    queue.close().await.unwrap();
}

#[tokio::test]
async fn test_clean_removes_finished_jobs() {
    let Some(queue) = connect(config()).await else { return };
    let mut events = queue.events().subscribe();
    queue
        .register_worker(Arc::new(FnHandler(|_ctx: JobContext| async {
            Ok::<_, JobError>(Value::Null)
        })))
        .await
        .unwrap();

    let id = queue.add_job("t", json!({}), JobOptions::default()).await.unwrap();
    wait_terminal(&mut events, &id).await;

    let report = queue.clean(Duration::ZERO).await.unwrap();
    assert_eq!(report.completed, 1);
    assert!(queue.get_job(&id).await.unwrap().is_none());
    queue.close().await.unwrap();
}

#[tokio::test]
async fn test_stalled_job_is_retried_then_failed() {
    let config = BrokerConfig {
        concurrency: 4,
        lock_duration: Duration::from_millis(300),
        // never renews within the test
        lock_renew: Duration::from_secs(60),
        max_stalled: 1,
        shutdown_grace: Duration::from_millis(100),
        ..config()
    };
    let metrics = Arc::new(QueueMetrics::new());
    let Some((queue, _)) = connect_with_metrics(config, metrics.clone()).await else { return };
    let mut events = queue.events().subscribe();
    let calls = Arc::new(AtomicU32::new(0));
    queue.register_worker(hanging_handler(calls.clone())).await.unwrap();

    let id = queue.add_job("t", json!({}), JobOptions::default()).await.unwrap();

    let mut retries = Vec::new();
    let failed = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await.unwrap() {
                QueueEvent::Retrying { id: job, attempt, error } if job == id => {
                    retries.push((attempt, error.code));
                }
                QueueEvent::Failed { id: job, error } if job == id => return error,
                _ => {}
            }
        }
    })
    .await
    .expect("stalled job was never failed");

    assert_eq!(retries, vec![(1, ErrorCode::JobStalled)]);
    assert_eq!(failed.code, ErrorCode::JobStalled);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let job = queue.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobState::Failed);
    assert_eq!(job.attempts, 2);
    assert_eq!(job.error.unwrap().code, ErrorCode::JobStalled);

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.jobs_retried, 1);
    assert_eq!(snapshot.jobs_failed, 1);
    // measured from when the second attempt was claimed
    assert!(snapshot.processing_ms_total >= 300);
    queue.close().await.unwrap();
}

#[tokio::test]
async fn test_lock_renewal_keeps_long_job_alive() {
    let config = BrokerConfig {
        lock_duration: Duration::from_millis(300),
        lock_renew: Duration::from_millis(100),
        max_stalled: 0,
        ..config()
    };
    let Some(queue) = connect(config).await else { return };
    let mut events = queue.events().subscribe();
    let calls = Arc::new(AtomicU32::new(0));

    let counter = calls.clone();
    queue
        .register_worker(Arc::new(FnHandler(move |_ctx: JobContext| {
            counter.fetch_add(1, Ordering::SeqCst);
            async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok::<_, JobError>(json!({ "done": true }))
            }
        })))
        .await
        .unwrap();

    let id = queue.add_job("t", json!({}), JobOptions::default()).await.unwrap();

    let mut retried = false;
    let finished = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await.unwrap() {
                QueueEvent::Retrying { id: job, .. } if job == id => retried = true,
                event @ (QueueEvent::Completed { .. } | QueueEvent::Failed { .. }) => {
                    return event
                }
                _ => {}
            }
        }
    })
    .await
    .unwrap();

    assert!(matches!(finished, QueueEvent::Completed { .. }), "got {finished:?}");
    assert!(!retried);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let job = queue.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobState::Completed);
    assert_eq!(job.attempts, 1);
    queue.close().await.unwrap();
}

#[tokio::test]
async fn test_delayed_job_is_promoted() {
    let Some(queue) = connect(config()).await else { return };
    let added = std::time::Instant::now();
    let id = queue
        .add_job(
            "t",
            json!({}),
            JobOptions::default().with_delay(Duration::from_millis(300)),
        )
        .await
        .unwrap();

    let job = queue.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobState::Queued);
    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.delayed, 1);
    assert_eq!(stats.waiting, 1);

    // no worker yet: only the maintenance sweep can promote it
    tokio::time::timeout(Duration::from_secs(5), async {
        while queue.stats().await.unwrap().delayed > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("delayed job was never promoted");
    assert!(added.elapsed() >= Duration::from_millis(300));

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.waiting, 1);
    assert_eq!(stats.delayed, 0);
    assert_eq!(
        queue.get_job(&id).await.unwrap().unwrap().status,
        JobState::Queued
    );
    queue.close().await.unwrap();
}

#[tokio::test]
async fn test_retention_sweep_drops_old_finished_jobs() {
    let config = BrokerConfig {
        retention: Duration::from_secs(60 * 60),
        ..config()
    };
    let Some((queue, name)) = connect_with_metrics(config, Arc::new(QueueMetrics::new())).await
    else {
        return;
    };
    let mut events = queue.events().subscribe();
    queue
        .register_worker(Arc::new(FnHandler(|_ctx: JobContext| async {
            Ok::<_, JobError>(Value::Null)
        })))
        .await
        .unwrap();

    let old = queue.add_job("t", json!({}), JobOptions::default()).await.unwrap();
    wait_terminal(&mut events, &old).await;
    let recent = queue.add_job("t", json!({}), JobOptions::default()).await.unwrap();
    wait_terminal(&mut events, &recent).await;

    // pretend the first job finished two hours ago
    let client = redis::Client::open(redis_url()).unwrap();
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();
    let two_hours_ago = chrono::Utc::now().timestamp_millis() - 2 * 60 * 60 * 1000;
    redis::AsyncCommands::zadd::<_, _, _, ()>(
        &mut conn,
        format!("convq:{{{name}}}:completed"),
        old.as_str(),
        two_hours_ago,
    )
    .await
    .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while queue.get_job(&old).await.unwrap().is_some() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("expired job was never removed");

    let job = queue.get_job(&recent).await.unwrap().unwrap();
    assert_eq!(job.status, JobState::Completed);
    assert_eq!(queue.stats().await.unwrap().completed, 1);
    queue.close().await.unwrap();
}

#[tokio::test]
async fn test_extreme_priorities_keep_fifo_order() {
    let Some(queue) = connect(config()).await else { return };
    let mut events = queue.events().subscribe();

    let mut ids = Vec::new();
    for priority in [0, i32::MAX, MAX_PRIORITY, i32::MIN] {
        ids.push(
            queue
                .add_job("t", json!({}), JobOptions::default().with_priority(priority))
                .await
                .unwrap(),
        );
    }
    let job = queue.get_job(&ids[1]).await.unwrap().unwrap();
    assert_eq!(job.priority, MAX_PRIORITY);

    queue
        .register_worker(Arc::new(FnHandler(|_ctx: JobContext| async {
            Ok::<_, JobError>(Value::Null)
        })))
        .await
        .unwrap();

    let mut order = Vec::new();
    while order.len() < ids.len() {
        if let QueueEvent::Completed { id, .. } = events.recv().await.unwrap() {
            order.push(id);
        }
    }
    assert_eq!(
        order,
        vec![ids[1].clone(), ids[2].clone(), ids[0].clone(), ids[3].clone()]
    );
    queue.close().await.unwrap();
}
