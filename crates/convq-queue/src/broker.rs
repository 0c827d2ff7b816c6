//! Redis-backed durable queue
//!
//! Job state lives in Redis under `convq:{<queue>}:`. Every state transition
//! is one Lua script so concurrent consumers never observe a half-moved job:
//!
//! - `id`: sequence counter, the source of job ids
//! - `job:<id>`: hash with the job's data, options and bookkeeping
//! - `wait`: sorted by priority rank (highest priority, then oldest, first)
//! - `delayed`: sorted by the ms timestamp the job becomes eligible
//! - `active`: sorted by lock expiry; an entry past its expiry has stalled
//! - `completed` / `failed`: sorted by finish time
//!
//! Attempts, backoff and the retry decision are made by the scripts from the
//! options stored on the hash at add time. This adapter only reports outcomes.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backend::{QueueBackend, QueueError};
use crate::config::BrokerConfig;
use crate::events::{EventBus, QueueEvent};
use crate::handler::{JobContext, JobHandler, ProgressSink};
use crate::job::{
    BackendKind, CleanReport, ErrorCode, JobError, JobId, JobOptions, JobSnapshot, JobState,
    QueueStats,
};
use crate::metrics::{MetricsSink, NoopMetrics, Outcome};

const STALLED_REASON: &str = "job stalled more than allowable limit";
const STALLED_RETRY_REASON: &str = "job lock expired, moved back to wait";

/// Helpers shared by every script. `KEYS[1]` is the key prefix.
///
/// The wait rank packs priority above a 32-bit id into one zset score. With
/// priority clamped to `MAX_PRIORITY` the score stays below 2^53, so it is
/// exact as a double for the first 2^32 ids of a queue.
const PRELUDE: &str = r#"
local prefix = KEYS[1]

local function rank(key, id)
  local priority = tonumber(redis.call('HGET', key, 'priority') or '0')
  return -priority * 4294967296 + tonumber(id)
end

local function promote(now)
  local due = redis.call('ZRANGEBYSCORE', prefix .. 'delayed', '-inf', now)
  for _, id in ipairs(due) do
    local key = prefix .. 'job:' .. id
    redis.call('ZREM', prefix .. 'delayed', id)
    redis.call('ZADD', prefix .. 'wait', rank(key, id), id)
    redis.call('HSET', key, 'state', 'waiting')
  end
  return #due
end

local function finish(key, id, target, now, retention)
  redis.call('ZREM', prefix .. 'active', id)
  redis.call('ZADD', prefix .. target, now, id)
  redis.call('HSET', key, 'state', target, 'finished_on', now, 'updated_at', now)
  redis.call('HDEL', key, 'lock_token')
  if retention > 0 then
    redis.call('PEXPIRE', key, retention)
  end
end

local function trim(target, keep)
  if keep < 0 then
    return
  end
  local extra = redis.call('ZRANGE', prefix .. target, 0, -(keep + 1))
  for _, id in ipairs(extra) do
    redis.call('DEL', prefix .. 'job:' .. id)
    redis.call('ZREM', prefix .. target, id)
  end
end
"#;

// ARGV: type, payload, priority, max_attempts, delay_ms, now, backoff_type, backoff_delay
const ADD: &str = r#"
local id = redis.call('INCR', prefix .. 'id')
local key = prefix .. 'job:' .. id
local delay = tonumber(ARGV[5])
local now = tonumber(ARGV[6])
local state = 'waiting'
if delay > 0 then
  state = 'delayed'
end
redis.call('HSET', key,
  'type', ARGV[1], 'payload', ARGV[2], 'priority', ARGV[3], 'max_attempts', ARGV[4],
  'attempts_made', 0, 'progress', 0, 'stalled', 0, 'state', state,
  'created_at', ARGV[6], 'updated_at', ARGV[6],
  'backoff_type', ARGV[7], 'backoff_delay', ARGV[8])
if delay > 0 then
  redis.call('ZADD', prefix .. 'delayed', now + delay, id)
else
  redis.call('ZADD', prefix .. 'wait', rank(key, id), id)
end
return tostring(id)
"#;

// ARGV: now, lock_ms, token
const CLAIM: &str = r#"
local now = tonumber(ARGV[1])
promote(now)
local popped = redis.call('ZPOPMIN', prefix .. 'wait')
if #popped == 0 then
  return false
end
local id = popped[1]
local key = prefix .. 'job:' .. id
if redis.call('EXISTS', key) == 0 then
  return false
end
redis.call('ZADD', prefix .. 'active', now + tonumber(ARGV[2]), id)
local attempts = redis.call('HINCRBY', key, 'attempts_made', 1)
redis.call('HSET', key, 'state', 'active', 'progress', 0, 'lock_token', ARGV[3],
  'processed_on', now, 'updated_at', now)
local fields = redis.call('HMGET', key, 'type', 'payload', 'max_attempts')
return {id, fields[1], fields[2], attempts, tonumber(fields[3])}
"#;

// ARGV: id, token, result, now, retention_ms, keep (-1 for all)
const COMPLETE: &str = r#"
local id = ARGV[1]
local key = prefix .. 'job:' .. id
if redis.call('HGET', key, 'lock_token') ~= ARGV[2] then
  return 0
end
redis.call('HSET', key, 'result', ARGV[3])
redis.call('HDEL', key, 'failed_reason', 'error_code')
finish(key, id, 'completed', tonumber(ARGV[4]), tonumber(ARGV[5]))
trim('completed', tonumber(ARGV[6]))
return 1
"#;

// ARGV: id, token, code, message, retryable, now, retention_ms, keep
// Returns the retry delay, -1 when the lock was lost, -2 on terminal failure.
const FAIL: &str = r#"
local id = ARGV[1]
local key = prefix .. 'job:' .. id
if redis.call('HGET', key, 'lock_token') ~= ARGV[2] then
  return -1
end
local now = tonumber(ARGV[6])
redis.call('HSET', key, 'error_code', ARGV[3], 'failed_reason', ARGV[4], 'updated_at', now)
local attempts = tonumber(redis.call('HGET', key, 'attempts_made'))
local max_attempts = tonumber(redis.call('HGET', key, 'max_attempts'))
if ARGV[5] == '1' and attempts < max_attempts then
  local base = tonumber(redis.call('HGET', key, 'backoff_delay'))
  local kind = redis.call('HGET', key, 'backoff_type')
  local delay = base
  if kind == 'exponential' then
    delay = base * 2 ^ (attempts - 1)
  elseif kind == 'linear' then
    delay = base * attempts
  end
  redis.call('ZREM', prefix .. 'active', id)
  redis.call('ZADD', prefix .. 'delayed', now + delay, id)
  redis.call('HSET', key, 'state', 'delayed')
  redis.call('HDEL', key, 'lock_token')
  return delay
end
finish(key, id, 'failed', now, tonumber(ARGV[7]))
trim('failed', tonumber(ARGV[8]))
return -2
"#;

// ARGV: id, token, percent, now
const PROGRESS: &str = r#"
local key = prefix .. 'job:' .. ARGV[1]
if redis.call('HGET', key, 'lock_token') ~= ARGV[2] then
  return 0
end
if tonumber(ARGV[3]) <= tonumber(redis.call('HGET', key, 'progress') or '0') then
  return 0
end
redis.call('HSET', key, 'progress', ARGV[3], 'updated_at', ARGV[4])
return 1
"#;

// ARGV: id, token, lock expiry
const RENEW: &str = r#"
if redis.call('HGET', prefix .. 'job:' .. ARGV[1], 'lock_token') ~= ARGV[2] then
  return 0
end
redis.call('ZADD', prefix .. 'active', 'XX', ARGV[3], ARGV[1])
return 1
"#;

// ARGV: now
const PROMOTE: &str = r#"
return promote(tonumber(ARGV[1]))
"#;

// ARGV: now, max_stalled, retention_ms, keep_failed, reason
// Returns {recovered ids, their attempts, failed ids, their processed_on}.
const STALLED: &str = r#"
local now = tonumber(ARGV[1])
local expired = redis.call('ZRANGEBYSCORE', prefix .. 'active', '-inf', now)
local recovered, recovered_attempts = {}, {}
local failed, failed_started = {}, {}
for _, id in ipairs(expired) do
  local key = prefix .. 'job:' .. id
  if redis.call('EXISTS', key) == 0 then
    redis.call('ZREM', prefix .. 'active', id)
  else
    local stalled = redis.call('HINCRBY', key, 'stalled', 1)
    local attempts = tonumber(redis.call('HGET', key, 'attempts_made'))
    local max_attempts = tonumber(redis.call('HGET', key, 'max_attempts'))
    if stalled > tonumber(ARGV[2]) or attempts >= max_attempts then
      local started = tonumber(redis.call('HGET', key, 'processed_on') or now)
      redis.call('HSET', key, 'error_code', 'JOB_STALLED', 'failed_reason', ARGV[5])
      finish(key, id, 'failed', now, tonumber(ARGV[3]))
      failed[#failed + 1] = id
      failed_started[#failed_started + 1] = started
    else
      redis.call('ZREM', prefix .. 'active', id)
      redis.call('ZADD', prefix .. 'wait', rank(key, id), id)
      redis.call('HSET', key, 'state', 'waiting', 'updated_at', now)
      redis.call('HDEL', key, 'lock_token')
      recovered[#recovered + 1] = id
      recovered_attempts[#recovered_attempts + 1] = attempts
    end
  end
end
trim('failed', tonumber(ARGV[4]))
return {recovered, recovered_attempts, failed, failed_started}
"#;

// ARGV: cutoff
const CLEAN: &str = r#"
local cutoff = tonumber(ARGV[1])
local counts = {}
for i, target in ipairs({'completed', 'failed'}) do
  local old = redis.call('ZRANGEBYSCORE', prefix .. target, '-inf', cutoff)
  for _, id in ipairs(old) do
    redis.call('DEL', prefix .. 'job:' .. id)
  end
  if #old > 0 then
    redis.call('ZREMRANGEBYSCORE', prefix .. target, '-inf', cutoff)
  end
  counts[i] = #old
end
return counts
"#;

struct Scripts {
    add: Script,
    claim: Script,
    complete: Script,
    fail: Script,
    progress: Script,
    renew: Script,
    promote: Script,
    stalled: Script,
    clean: Script,
}

impl Scripts {
    fn load() -> Self {
        let script = |body: &str| Script::new(&format!("{PRELUDE}{body}"));
        Self {
            add: script(ADD),
            claim: script(CLAIM),
            complete: script(COMPLETE),
            fail: script(FAIL),
            progress: script(PROGRESS),
            renew: script(RENEW),
            promote: script(PROMOTE),
            stalled: script(STALLED),
            clean: script(CLEAN),
        }
    }
}

/// Key layout of one queue
#[derive(Debug, Clone)]
struct Keys {
    prefix: String,
}

impl Keys {
    fn new(queue: &str) -> Self {
        // hash tag keeps every key of a queue in one cluster slot
        Self {
            prefix: format!("convq:{{{queue}}}:"),
        }
    }

    fn set(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    fn job(&self, id: &JobId) -> String {
        format!("{}job:{}", self.prefix, id)
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Time between a stored ms timestamp and `now`; zero if the clock went backwards
fn elapsed_since(started_ms: i64, now_ms: i64) -> Duration {
    Duration::from_millis(now_ms.saturating_sub(started_ms).max(0) as u64)
}

fn keep_arg(keep: Option<usize>) -> i64 {
    keep.map_or(-1, |k| k as i64)
}

/// Job handed to this consumer by the claim script
struct ActiveJob {
    id: JobId,
    job_type: String,
    payload: Value,
    attempt: u32,
    max_attempts: u32,
    token: String,
}

struct BrokerShared {
    config: BrokerConfig,
    keys: Keys,
    conn: MultiplexedConnection,
    scripts: Scripts,
    handler: OnceLock<Arc<dyn JobHandler>>,
    permits: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
    events: EventBus,
    metrics: Arc<dyn MetricsSink>,
}

impl BrokerShared {
    fn conn(&self) -> MultiplexedConnection {
        self.conn.clone()
    }

    async fn claim(&self) -> Result<Option<ActiveJob>, QueueError> {
        let token = Uuid::new_v4().to_string();
        let mut conn = self.conn();
        let claimed: Option<(String, String, String, u32, u32)> = self
            .scripts
            .claim
            .key(&self.keys.prefix)
            .arg(now_ms())
            .arg(self.config.lock_duration.as_millis() as u64)
            .arg(&token)
            .invoke_async(&mut conn)
            .await?;

        let Some((id, job_type, payload, attempt, max_attempts)) = claimed else {
            return Ok(None);
        };
        Ok(Some(ActiveJob {
            id: JobId::new(id),
            job_type,
            payload: serde_json::from_str(&payload)?,
            attempt,
            max_attempts,
            token,
        }))
    }

    async fn renew_lock(&self, job: &ActiveJob) -> Result<bool, QueueError> {
        let mut conn = self.conn();
        let expires = now_ms() + self.config.lock_duration.as_millis() as i64;
        let renewed: i64 = self
            .scripts
            .renew
            .key(&self.keys.prefix)
            .arg(job.id.as_str())
            .arg(&job.token)
            .arg(expires)
            .invoke_async(&mut conn)
            .await?;
        Ok(renewed == 1)
    }

    /// Report the outcome of an attempt and publish the matching event.
    async fn settle(
        &self,
        job: &ActiveJob,
        outcome: Result<Value, JobError>,
        elapsed: Duration,
    ) -> Result<(), QueueError> {
        let mut conn = self.conn();
        let retention = self.config.retention.as_millis() as u64;

        match outcome {
            Ok(result) => {
                let stored: i64 = self
                    .scripts
                    .complete
                    .key(&self.keys.prefix)
                    .arg(job.id.as_str())
                    .arg(&job.token)
                    .arg(serde_json::to_string(&result)?)
                    .arg(now_ms())
                    .arg(retention)
                    .arg(keep_arg(self.config.keep_completed))
                    .invoke_async(&mut conn)
                    .await?;
                if stored == 0 {
                    warn!(job_id = %job.id, "Lock lost before completion, result discarded");
                    return Ok(());
                }

                info!(job_id = %job.id, attempts = job.attempt, "Job completed");
                self.metrics
                    .record_outcome(Outcome::Completed, elapsed, None);
                self.events.emit(QueueEvent::Completed {
                    id: job.id.clone(),
                    data: job.payload.clone(),
                    result,
                });
            }
            Err(err) => {
                let delay: i64 = self
                    .scripts
                    .fail
                    .key(&self.keys.prefix)
                    .arg(job.id.as_str())
                    .arg(&job.token)
                    .arg(err.code.as_str())
                    .arg(&err.message)
                    .arg(if err.is_retryable() { "1" } else { "0" })
                    .arg(now_ms())
                    .arg(retention)
                    .arg(keep_arg(self.config.keep_failed))
                    .invoke_async(&mut conn)
                    .await?;

                match delay {
                    -1 => {
                        warn!(job_id = %job.id, error = %err, "Lock lost before failure was recorded");
                    }
                    -2 => {
                        error!(job_id = %job.id, attempts = job.attempt, error = %err, "Job failed permanently");
                        self.metrics
                            .record_outcome(Outcome::Failed, elapsed, Some(err.code));
                        self.events.emit(QueueEvent::Failed {
                            id: job.id.clone(),
                            error: err,
                        });
                    }
                    delay_ms => {
                        warn!(
                            job_id = %job.id,
                            attempt = job.attempt,
                            max_attempts = job.max_attempts,
                            delay_ms,
                            error = %err,
                            "Job failed, scheduling retry with backoff"
                        );
                        self.metrics.record_retry();
                        self.events.emit(QueueEvent::Retrying {
                            id: job.id.clone(),
                            attempt: job.attempt,
                            error: err,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    async fn promote_delayed(&self) -> Result<u64, QueueError> {
        let mut conn = self.conn();
        Ok(self
            .scripts
            .promote
            .key(&self.keys.prefix)
            .arg(now_ms())
            .invoke_async(&mut conn)
            .await?)
    }

    async fn recover_stalled(&self) -> Result<(), QueueError> {
        let mut conn = self.conn();
        let now = now_ms();
        let (recovered, recovered_attempts, failed, failed_started): (
            Vec<String>,
            Vec<u32>,
            Vec<String>,
            Vec<i64>,
        ) = self
            .scripts
            .stalled
            .key(&self.keys.prefix)
            .arg(now)
            .arg(self.config.max_stalled)
            .arg(self.config.retention.as_millis() as u64)
            .arg(keep_arg(self.config.keep_failed))
            .arg(STALLED_REASON)
            .invoke_async(&mut conn)
            .await?;

        // the stalled attempt is spent, so going back to wait is a retry
        for (id, attempt) in recovered.into_iter().zip(recovered_attempts) {
            warn!(job_id = %id, attempt, "Stalled job moved back to wait");
            self.metrics.record_retry();
            self.events.emit(QueueEvent::Retrying {
                id: JobId::new(id),
                attempt,
                error: JobError::new(ErrorCode::JobStalled, STALLED_RETRY_REASON),
            });
        }
        for (id, started) in failed.into_iter().zip(failed_started) {
            error!(job_id = %id, "Job failed after stalling too often");
            self.metrics.record_outcome(
                Outcome::Failed,
                elapsed_since(started, now),
                Some(ErrorCode::JobStalled),
            );
            self.events.emit(QueueEvent::Failed {
                id: JobId::new(id),
                error: JobError::new(ErrorCode::JobStalled, STALLED_REASON),
            });
        }
        Ok(())
    }

    async fn clean(&self, grace: Duration) -> Result<CleanReport, QueueError> {
        let mut conn = self.conn();
        let cutoff = now_ms() - grace.as_millis() as i64;
        let (completed, failed): (u64, u64) = self
            .scripts
            .clean
            .key(&self.keys.prefix)
            .arg(cutoff)
            .invoke_async(&mut conn)
            .await?;
        Ok(CleanReport { completed, failed })
    }

    async fn snapshot(&self, id: &JobId) -> Result<Option<JobSnapshot>, QueueError> {
        let mut conn = self.conn();
        let fields: HashMap<String, String> = conn.hgetall(self.keys.job(id)).await?;
        snapshot_from_hash(id, &fields)
    }
}

fn millis_to_datetime(ms: &str) -> Option<DateTime<Utc>> {
    let ms = ms.parse::<i64>().ok()?;
    Utc.timestamp_millis_opt(ms).single()
}

/// Rebuild a snapshot from a job hash. An empty hash is an unknown or expired job.
fn snapshot_from_hash(
    id: &JobId,
    fields: &HashMap<String, String>,
) -> Result<Option<JobSnapshot>, QueueError> {
    if fields.is_empty() {
        return Ok(None);
    }

    let field = |name: &str| fields.get(name).map(String::as_str);
    let number = |name: &str| field(name).and_then(|v| v.parse::<f64>().ok());

    let state = field("state").unwrap_or("waiting");
    let status = JobState::from_native(state)
        .ok_or_else(|| QueueError::Backend(format!("unknown job state {state:?}")))?;

    let data = match field("payload") {
        Some(raw) => serde_json::from_str(raw)?,
        None => Value::Null,
    };
    let result = match field("result") {
        Some(raw) if status == JobState::Completed => Some(serde_json::from_str(raw)?),
        _ => None,
    };
    let failed_reason = field("failed_reason").map(str::to_string);
    let error = failed_reason.as_ref().map(|message| {
        let code = field("error_code")
            .and_then(ErrorCode::parse)
            .unwrap_or(ErrorCode::HandlerError);
        JobError::new(code, message.clone())
    });

    let created_at = field("created_at")
        .and_then(millis_to_datetime)
        .unwrap_or_else(Utc::now);
    let updated_at = field("updated_at")
        .and_then(millis_to_datetime)
        .unwrap_or(created_at);

    Ok(Some(JobSnapshot {
        id: id.clone(),
        job_type: field("type").unwrap_or_default().to_string(),
        status,
        progress: number("progress").unwrap_or(0.0).clamp(0.0, 100.0) as u8,
        data,
        attempts: number("attempts_made").unwrap_or(0.0) as u32,
        max_attempts: number("max_attempts").unwrap_or(0.0) as u32,
        priority: number("priority").unwrap_or(0.0) as i32,
        result,
        error,
        created_at,
        updated_at,
        finished_on: field("finished_on").and_then(millis_to_datetime),
        failed_reason,
        backend: BackendKind::Broker,
    }))
}

struct BrokerProgress {
    shared: Arc<BrokerShared>,
    id: JobId,
    token: String,
}

#[async_trait]
impl ProgressSink for BrokerProgress {
    async fn report(&self, percent: u8) {
        let mut conn = self.shared.conn();
        let reported: Result<i64, redis::RedisError> = self
            .shared
            .scripts
            .progress
            .key(&self.shared.keys.prefix)
            .arg(self.id.as_str())
            .arg(&self.token)
            .arg(u32::from(percent))
            .arg(now_ms())
            .invoke_async(&mut conn)
            .await;
        if let Err(e) = reported {
            debug!(job_id = %self.id, error = %e, "Progress update dropped");
        }
    }
}

/// Durable queue on a Redis broker
pub struct RedisQueue {
    shared: Arc<BrokerShared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl RedisQueue {
    /// Connect and verify the broker answers within `probe_timeout`.
    pub async fn connect(name: &str, config: BrokerConfig) -> Result<Self, QueueError> {
        Self::connect_with_observers(name, config, EventBus::default(), Arc::new(NoopMetrics))
            .await
    }

    pub async fn connect_with_observers(
        name: &str,
        config: BrokerConfig,
        events: EventBus,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| QueueError::BackendUnavailable(e.to_string()))?;

        let probe = async {
            let mut conn = client.get_multiplexed_async_connection().await?;
            let _: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok::<_, redis::RedisError>(conn)
        };
        let conn = match tokio::time::timeout(config.probe_timeout, probe).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => return Err(QueueError::BackendUnavailable(e.to_string())),
            Err(_) => {
                return Err(QueueError::BackendUnavailable(format!(
                    "no answer within {}ms",
                    config.probe_timeout.as_millis()
                )))
            }
        };

        let concurrency = config.concurrency.max(1);
        let (shutdown, _) = watch::channel(false);
        let shared = Arc::new(BrokerShared {
            config: BrokerConfig {
                concurrency,
                ..config
            },
            keys: Keys::new(name),
            conn,
            scripts: Scripts::load(),
            handler: OnceLock::new(),
            permits: Arc::new(Semaphore::new(concurrency)),
            shutdown,
            events,
            metrics,
        });

        let maintenance = tokio::spawn(maintenance_loop(shared.clone()));
        info!(queue = name, concurrency, "Redis queue connected");

        Ok(Self {
            shared,
            tasks: Mutex::new(vec![maintenance]),
            closed: AtomicBool::new(false),
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.shared.events
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
impl QueueBackend for RedisQueue {
    fn kind(&self) -> BackendKind {
        BackendKind::Broker
    }

    async fn add_job(
        &self,
        job_type: &str,
        payload: Value,
        options: JobOptions,
    ) -> Result<JobId, QueueError> {
        self.ensure_open()?;

        let config = &self.shared.config;
        let priority = options.priority();
        let mut conn = self.shared.conn();
        let id: String = self
            .shared
            .scripts
            .add
            .key(&self.shared.keys.prefix)
            .arg(job_type)
            .arg(serde_json::to_string(&payload)?)
            .arg(priority)
            .arg(options.max_attempts.unwrap_or(config.max_attempts).max(1))
            .arg(options.delay().as_millis() as u64)
            .arg(now_ms())
            .arg(config.backoff.kind())
            .arg(config.backoff.base().as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;

        debug!(job_id = %id, job_type, priority, "Job queued");
        Ok(JobId::new(id))
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<JobSnapshot>, QueueError> {
        self.shared.snapshot(id).await
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let keys = &self.shared.keys;
        let (mut c1, mut c2, mut c3, mut c4, mut c5) = (
            self.shared.conn(),
            self.shared.conn(),
            self.shared.conn(),
            self.shared.conn(),
            self.shared.conn(),
        );
        let (wait, delayed, active, completed, failed) = futures::try_join!(
            c1.zcard::<_, u64>(keys.set("wait")),
            c2.zcard::<_, u64>(keys.set("delayed")),
            c3.zcard::<_, u64>(keys.set("active")),
            c4.zcard::<_, u64>(keys.set("completed")),
            c5.zcard::<_, u64>(keys.set("failed")),
        )?;

        let max_workers = self.shared.config.concurrency;
        let active_workers = if self.shared.handler.get().is_some() {
            max_workers.saturating_sub(self.shared.permits.available_permits())
        } else {
            0
        };

        Ok(QueueStats::new(
            BackendKind::Broker,
            wait + delayed,
            delayed,
            active,
            completed,
            failed,
            active_workers as u64,
            max_workers as u64,
        ))
    }

    async fn register_worker(&self, handler: Arc<dyn JobHandler>) -> Result<(), QueueError> {
        self.ensure_open()?;
        self.shared
            .handler
            .set(handler.clone())
            .map_err(|_| QueueError::WorkerAlreadyRegistered)?;

        let consumer = tokio::spawn(consume_loop(self.shared.clone(), handler));
        self.tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(consumer);

        info!(
            concurrency = self.shared.config.concurrency,
            "Redis worker registered"
        );
        Ok(())
    }

    async fn list_failed(&self, limit: usize) -> Result<Vec<JobSnapshot>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.shared.conn();
        let ids: Vec<String> = conn
            .zrevrange(self.shared.keys.set("failed"), 0, limit as isize - 1)
            .await?;

        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = self.shared.snapshot(&JobId::new(id)).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn clean(&self, grace: Duration) -> Result<CleanReport, QueueError> {
        self.shared.clean(grace).await
    }

    async fn ping(&self) -> Result<Duration, QueueError> {
        let started = Instant::now();
        let mut conn = self.shared.conn();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(started.elapsed())
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

        let all = self.shared.config.concurrency as u32;
        if tokio::time::timeout(
            self.shared.config.shutdown_grace,
            self.shared.permits.acquire_many(all),
        )
        .await
        .is_err()
        {
            // the broker recovers these through stall detection
            warn!("Shutdown grace elapsed with jobs still running");
        }
        self.shared.permits.close();

        info!("Redis queue closed");
        Ok(())
    }
}

impl Drop for RedisQueue {
    fn drop(&mut self) {
        let _ = self.shared.shutdown.send(true);
    }
}

async fn consume_loop(shared: Arc<BrokerShared>, handler: Arc<dyn JobHandler>) {
    let mut shutdown = shared.shutdown.subscribe();

    loop {
        if *shutdown.borrow() {
            break;
        }

        let permit = tokio::select! {
            permit = shared.permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = shutdown.changed() => break,
        };

        let backoff = match shared.claim().await {
            Ok(Some(job)) => {
                tokio::spawn(run_attempt(shared.clone(), handler.clone(), job, permit));
                continue;
            }
            Ok(None) => shared.config.poll_interval,
            Err(e) => {
                error!(error = %e, "Queue error");
                Duration::from_secs(1)
            }
        };
        drop(permit);

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.changed() => break,
        }
    }

    debug!("Consumer stopped");
}

async fn run_attempt(
    shared: Arc<BrokerShared>,
    handler: Arc<dyn JobHandler>,
    job: ActiveJob,
    permit: tokio::sync::OwnedSemaphorePermit,
) {
    debug!(job_id = %job.id, job_type = %job.job_type, attempt = job.attempt, "Processing job");
    let started = Instant::now();

    let progress = Arc::new(BrokerProgress {
        shared: shared.clone(),
        id: job.id.clone(),
        token: job.token.clone(),
    });
    let ctx = JobContext::new(
        job.id.clone(),
        job.job_type.clone(),
        job.payload.clone(),
        job.attempt,
        job.max_attempts,
        progress,
    );

    let mut task = tokio::spawn(async move { handler.handle(ctx).await });
    let mut renew = tokio::time::interval(shared.config.lock_renew.max(Duration::from_millis(10)));
    renew.tick().await;

    let outcome = loop {
        tokio::select! {
            joined = &mut task => break match joined {
                Ok(outcome) => outcome,
                Err(e) if e.is_panic() => Err(JobError::new(ErrorCode::HandlerPanic, "handler panicked")),
                Err(e) => Err(JobError::new(ErrorCode::HandlerError, e.to_string())),
            },
            _ = renew.tick() => match shared.renew_lock(&job).await {
                Ok(true) => {}
                Ok(false) => warn!(job_id = %job.id, "Job lock was taken over"),
                Err(e) => warn!(job_id = %job.id, error = %e, "Lock renewal failed"),
            },
        }
    };

    if let Err(e) = shared.settle(&job, outcome, started.elapsed()).await {
        // the lock expires and stall recovery picks the job up again
        error!(job_id = %job.id, error = %e, "Failed to record job outcome");
    }
    drop(permit);
}

async fn maintenance_loop(shared: Arc<BrokerShared>) {
    let mut shutdown = shared.shutdown.subscribe();
    let mut ticker = tokio::time::interval(shared.config.maintenance_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = shared.promote_delayed().await {
                    warn!(error = %e, "Delayed job promotion failed");
                }
                if let Err(e) = shared.recover_stalled().await {
                    warn!(error = %e, "Stalled job check failed");
                }
                match shared.clean(shared.config.retention).await {
                    Ok(report) if report.completed + report.failed > 0 => {
                        debug!(completed = report.completed, failed = report.failed, "Expired jobs removed");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Retention sweep failed"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}
