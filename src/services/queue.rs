//! Durable, multi-consumer classification job queue.
//!
//! Delivery is at-least-once: a dequeued job is leased to one consumer and
//! becomes redeliverable if neither `ack` nor `nack` arrives before the lease
//! expires.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::models::job::{Job, JobStatus};

/// Identifies one delivery of a job; consumed by `ack`/`nack`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckHandle {
    pub job_id: Uuid,
    /// Distinguishes this delivery from later redeliveries of the same job.
    pub lease_id: Uuid,
    pub attempts: u32,
    pub max_attempts: u32,
}

/// A leased job handed to a worker.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub job: Job,
    pub handle: AckHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    /// Back on the pending list with the new attempt count.
    Requeued { attempts: u32 },
    /// Budget exhausted or not requeued; no automatic redelivery.
    Failed,
    /// The lease had already expired and the job was reclaimed elsewhere.
    LeaseLost,
}

/// Result of one stalled-lease sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    pub requeued: u64,
    /// Stalled on the final delivery; requeued with the attempt count held
    /// at the last attempt so the next consumer still produces a result.
    pub exhausted: u64,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: &Job) -> Result<(), QueueError>;

    /// Lease the next pending job, or `None` when the queue is empty.
    /// Expired leases are reclaimed first.
    async fn dequeue(&self) -> Result<Option<Delivery>, QueueError>;

    /// Mark the delivery completed. Returns `false` if the lease was lost.
    async fn ack(&self, handle: &AckHandle) -> Result<bool, QueueError>;

    async fn nack(&self, handle: &AckHandle, requeue: bool) -> Result<NackOutcome, QueueError>;

    /// Move jobs whose lease expired back to pending, consuming one attempt.
    /// A job never leaves the queue through a stall: once its budget is spent
    /// it stays on its final attempt. Also trims expired completion records.
    async fn reclaim_stalled(&self) -> Result<ReclaimReport, QueueError>;

    /// Number of jobs waiting for delivery.
    async fn depth(&self) -> Result<u64, QueueError>;

    async fn status(&self, job_id: Uuid) -> Result<Option<JobStatus>, QueueError>;

    async fn health_check(&self) -> Result<(), QueueError>;
}

const DEQUEUE_SCRIPT: &str = r#"
local id = redis.call('RPOP', KEYS[1])
if not id then return false end
redis.call('ZADD', KEYS[2], ARGV[1], id)
redis.call('HSET', KEYS[5], id, ARGV[2])
local payload = redis.call('HGET', KEYS[3], id)
local attempts = redis.call('HGET', KEYS[4], id) or '0'
return {id, payload or '', attempts}
"#;

const ACK_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[5], ARGV[1]) ~= ARGV[3] then return 0 end
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then return 0 end
redis.call('HDEL', KEYS[5], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[3], ARGV[1])
redis.call('ZADD', KEYS[4], ARGV[2], ARGV[1])
return 1
"#;

// Returns the new attempt count when requeued, -1 when failed, -2 when the lease was lost.
const NACK_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[5], ARGV[1]) ~= ARGV[4] then return -2 end
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then return -2 end
redis.call('HDEL', KEYS[5], ARGV[1])
if ARGV[2] == '1' then
  local attempts = redis.call('HINCRBY', KEYS[2], ARGV[1], 1)
  if attempts < tonumber(ARGV[3]) then
    redis.call('LPUSH', KEYS[3], ARGV[1])
    return attempts
  end
end
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[6], ARGV[1])
redis.call('ZADD', KEYS[4], ARGV[5], ARGV[1])
return -1
"#;

// A stalled final delivery goes back to pending at attempt max-1.
const RECLAIM_SCRIPT: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[3])
local requeued, exhausted = 0, 0
local last = tonumber(ARGV[2]) - 1
for _, id in ipairs(ids) do
  redis.call('ZREM', KEYS[1], id)
  redis.call('HDEL', KEYS[4], id)
  local attempts = redis.call('HINCRBY', KEYS[2], id, 1)
  if attempts > last then
    redis.call('HSET', KEYS[2], id, last)
    exhausted = exhausted + 1
  else
    requeued = requeued + 1
  end
  redis.call('LPUSH', KEYS[3], id)
end
redis.call('ZREMRANGEBYSCORE', KEYS[5], '-inf', ARGV[4])
redis.call('ZREMRANGEBYSCORE', KEYS[6], '-inf', ARGV[4])
return {requeued, exhausted}
"#;

const RECLAIM_BATCH: u64 = 100;
/// How long completed and failed ids stay queryable through `status`.
const TERMINAL_RETENTION_MS: i64 = 24 * 60 * 60 * 1000;

struct QueueKeys {
    pending: String,
    leases: String,
    jobs: String,
    attempts: String,
    failed: String,
    completed: String,
    lease_tokens: String,
}

impl QueueKeys {
    fn new(prefix: &str) -> Self {
        Self {
            pending: format!("{prefix}:pending"),
            leases: format!("{prefix}:leases"),
            jobs: format!("{prefix}:jobs"),
            attempts: format!("{prefix}:attempts"),
            failed: format!("{prefix}:failed"),
            completed: format!("{prefix}:completed"),
            lease_tokens: format!("{prefix}:lease_tokens"),
        }
    }
}

/// Redis-backed job queue.
///
/// Pending ids live in a list, active leases in a sorted set scored by lease
/// deadline, job bodies and attempt counts in hashes. Completed and failed ids
/// sit in sorted sets scored by when they finished and are trimmed after a day.
/// Every state transition runs as a single Lua script, so concurrent consumers
/// never share a lease.
pub struct RedisJobQueue {
    conn: MultiplexedConnection,
    keys: QueueKeys,
    lease: Duration,
    dequeue_script: Script,
    ack_script: Script,
    nack_script: Script,
    reclaim_script: Script,
}

impl RedisJobQueue {
    pub async fn connect(redis_url: &str, prefix: &str, lease: Duration) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)?;
        Ok(Self {
            conn,
            keys: QueueKeys::new(prefix),
            lease,
            dequeue_script: Script::new(DEQUEUE_SCRIPT),
            ack_script: Script::new(ACK_SCRIPT),
            nack_script: Script::new(NACK_SCRIPT),
            reclaim_script: Script::new(RECLAIM_SCRIPT),
        })
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// Park an unreadable job as failed so it is not redelivered forever.
    async fn discard_undecodable(
        &self,
        conn: &mut MultiplexedConnection,
        id: &str,
    ) -> Result<(), QueueError> {
        redis::pipe()
            .atomic()
            .zrem(&self.keys.leases, id)
            .ignore()
            .hdel(&self.keys.lease_tokens, id)
            .ignore()
            .hdel(&self.keys.jobs, id)
            .ignore()
            .hdel(&self.keys.attempts, id)
            .ignore()
            .zadd(&self.keys.failed, id, Self::now_ms())
            .ignore()
            .query_async::<()>(conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, job: &Job) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(job).map_err(QueueError::Serialize)?;
        let id = job.id.to_string();
        redis::pipe()
            .atomic()
            .hset(&self.keys.jobs, &id, payload)
            .ignore()
            .hset(&self.keys.attempts, &id, job.attempts)
            .ignore()
            .lpush(&self.keys.pending, &id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<Delivery>, QueueError> {
        let reclaimed = self.reclaim_stalled().await?;
        if reclaimed.requeued + reclaimed.exhausted > 0 {
            tracing::warn!(
                requeued = reclaimed.requeued,
                exhausted = reclaimed.exhausted,
                "Reclaimed stalled jobs"
            );
        }

        let mut conn = self.conn.clone();
        loop {
            let deadline = Self::now_ms() + self.lease.as_millis() as i64;
            let lease_id = Uuid::new_v4();
            let leased: Option<(String, String, u32)> = self
                .dequeue_script
                .key(&self.keys.pending)
                .key(&self.keys.leases)
                .key(&self.keys.jobs)
                .key(&self.keys.attempts)
                .key(&self.keys.lease_tokens)
                .arg(deadline)
                .arg(lease_id.to_string())
                .invoke_async(&mut conn)
                .await
                .map_err(QueueError::Redis)?;

            let Some((id, payload, attempts)) = leased else {
                return Ok(None);
            };

            let mut job: Job = match serde_json::from_str(&payload) {
                Ok(job) => job,
                Err(e) => {
                    tracing::error!(job_id = %id, error = %e, "Dropping undecodable job");
                    self.discard_undecodable(&mut conn, &id).await?;
                    continue;
                }
            };
            job.attempts = attempts;

            let handle = AckHandle {
                job_id: job.id,
                lease_id,
                attempts: job.attempts,
                max_attempts: job.max_attempts,
            };
            return Ok(Some(Delivery { job, handle }));
        }
    }

    async fn ack(&self, handle: &AckHandle) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let acked: i64 = self
            .ack_script
            .key(&self.keys.leases)
            .key(&self.keys.jobs)
            .key(&self.keys.attempts)
            .key(&self.keys.completed)
            .key(&self.keys.lease_tokens)
            .arg(handle.job_id.to_string())
            .arg(Self::now_ms())
            .arg(handle.lease_id.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(acked == 1)
    }

    async fn nack(&self, handle: &AckHandle, requeue: bool) -> Result<NackOutcome, QueueError> {
        let mut conn = self.conn.clone();
        let outcome: i64 = self
            .nack_script
            .key(&self.keys.leases)
            .key(&self.keys.attempts)
            .key(&self.keys.pending)
            .key(&self.keys.failed)
            .key(&self.keys.lease_tokens)
            .key(&self.keys.jobs)
            .arg(handle.job_id.to_string())
            .arg(if requeue { "1" } else { "0" })
            .arg(handle.max_attempts)
            .arg(handle.lease_id.to_string())
            .arg(Self::now_ms())
            .invoke_async(&mut conn)
            .await
            .map_err(QueueError::Redis)?;

        Ok(match outcome {
            -2 => NackOutcome::LeaseLost,
            -1 => NackOutcome::Failed,
            attempts => NackOutcome::Requeued {
                attempts: attempts as u32,
            },
        })
    }

    async fn reclaim_stalled(&self) -> Result<ReclaimReport, QueueError> {
        let mut conn = self.conn.clone();
        let now = Self::now_ms();
        let (requeued, exhausted): (u64, u64) = self
            .reclaim_script
            .key(&self.keys.leases)
            .key(&self.keys.attempts)
            .key(&self.keys.pending)
            .key(&self.keys.lease_tokens)
            .key(&self.keys.completed)
            .key(&self.keys.failed)
            .arg(now)
            .arg(crate::models::job::MAX_ATTEMPTS)
            .arg(RECLAIM_BATCH)
            .arg(now - TERMINAL_RETENTION_MS)
            .invoke_async(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(ReclaimReport {
            requeued,
            exhausted,
        })
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        let depth: u64 = conn
            .llen(&self.keys.pending)
            .await
            .map_err(QueueError::Redis)?;
        Ok(depth)
    }

    async fn status(&self, job_id: Uuid) -> Result<Option<JobStatus>, QueueError> {
        let mut conn = self.conn.clone();
        let id = job_id.to_string();

        let failed: Option<f64> = conn
            .zscore(&self.keys.failed, &id)
            .await
            .map_err(QueueError::Redis)?;
        if failed.is_some() {
            return Ok(Some(JobStatus::Failed));
        }
        let leased: Option<f64> = conn
            .zscore(&self.keys.leases, &id)
            .await
            .map_err(QueueError::Redis)?;
        if leased.is_some() {
            return Ok(Some(JobStatus::Active));
        }
        let known: bool = conn
            .hexists(&self.keys.jobs, &id)
            .await
            .map_err(QueueError::Redis)?;
        if known {
            return Ok(Some(JobStatus::Pending));
        }
        let completed: Option<f64> = conn
            .zscore(&self.keys.completed, &id)
            .await
            .map_err(QueueError::Redis)?;
        Ok(completed.map(|_| JobStatus::Completed))
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The queue backend is unreachable; fatal to the worker loop.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
