//! Redis-backed broker
//!
//! Key layout (prefix `ferroq:`):
//! - `ferroq:queue:{name}`: LIST of job ids, RPUSH tail / LPOP head (FIFO)
//! - `ferroq:scheduled`: ZSET of job ids scored by due-time millis
//! - `ferroq:job:{id}`: HASH with `data` (job JSON), `queue`, `state`,
//!   `retry_count`, `last_error`, `next_retry_at`
//! - `ferroq:archived`: ZSET of archived job ids scored by archive time
//!
//! Scheduled members are UUID v7 ids, so the lexicographic tie-break within
//! one due-time score preserves creation order.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use tracing::debug;
use uuid::Uuid;

use super::client::{Broker, BrokerConnector, BrokerError, DequeuedJob, QueueWeights};
use crate::job::Job;

const SCHEDULED_KEY: &str = "ferroq:scheduled";
const ARCHIVED_KEY: &str = "ferroq:archived";

/// How many due scheduled jobs one pop promotes at most
const PROMOTE_BATCH: usize = 100;

/// Poll step while a pop waits for work
const POP_POLL_STEP: Duration = Duration::from_millis(500);

/// Completed job hashes linger this long for inspection
const COMPLETED_TTL_SECS: i64 = 3600;

fn queue_key(queue: &str) -> String {
    format!("ferroq:queue:{queue}")
}

fn job_key(id: &str) -> String {
    format!("ferroq:job:{id}")
}

fn map_redis_err(err: redis::RedisError) -> BrokerError {
    if err.is_io_error() || err.is_timeout() || err.is_connection_refusal() {
        BrokerError::Unreachable(err.to_string())
    } else {
        BrokerError::Protocol(err.to_string())
    }
}

/// Redis implementation of the [`Broker`] contract
#[derive(Clone)]
pub struct RedisBroker {
    conn: ConnectionManager,
}

impl RedisBroker {
    /// Connect to a Redis instance, e.g. `redis://127.0.0.1:6379`
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let client = redis::Client::open(url)
            .map_err(|e| BrokerError::Protocol(format!("invalid broker url: {e}")))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(map_redis_err)?;
        Ok(Self { conn })
    }

    async fn store_job(&self, job: &Job, state: &str) -> Result<String, BrokerError> {
        let data = serde_json::to_string(job).map_err(|e| BrokerError::Encode(e.to_string()))?;
        let id = job.id.to_string();
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("HSET")
            .arg(job_key(&id))
            .arg("data")
            .arg(&data)
            .arg("queue")
            .arg(&job.queue)
            .arg("state")
            .arg(state)
            .arg("retry_count")
            .arg(0)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_err)?;
        Ok(id)
    }

    async fn assert_known(&self, job_id: Uuid) -> Result<String, BrokerError> {
        let id = job_id.to_string();
        let mut conn = self.conn.clone();
        let exists: i64 = redis::cmd("EXISTS")
            .arg(job_key(&id))
            .query_async(&mut conn)
            .await
            .map_err(map_redis_err)?;
        if exists == 0 {
            return Err(BrokerError::JobNotFound(job_id));
        }
        Ok(id)
    }

    /// Move due scheduled jobs into their target queues.
    async fn promote_due(&self, now: DateTime<Utc>) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(SCHEDULED_KEY)
            .arg("-inf")
            .arg(now.timestamp_millis())
            .arg("LIMIT")
            .arg(0)
            .arg(PROMOTE_BATCH)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_err)?;

        for id in due {
            // ZREM decides which client wins a concurrent promotion
            let removed: i64 = redis::cmd("ZREM")
                .arg(SCHEDULED_KEY)
                .arg(&id)
                .query_async(&mut conn)
                .await
                .map_err(map_redis_err)?;
            if removed == 0 {
                continue;
            }

            let queue: Option<String> = redis::cmd("HGET")
                .arg(job_key(&id))
                .arg("queue")
                .query_async(&mut conn)
                .await
                .map_err(map_redis_err)?;
            let Some(queue) = queue else {
                debug!(job_id = %id, "scheduled job vanished before promotion");
                continue;
            };

            let _: () = redis::pipe()
                .atomic()
                .cmd("HSET")
                .arg(job_key(&id))
                .arg("state")
                .arg("pending")
                .ignore()
                .cmd("RPUSH")
                .arg(queue_key(&queue))
                .arg(&id)
                .ignore()
                .query_async(&mut conn)
                .await
                .map_err(map_redis_err)?;
        }
        Ok(())
    }

    async fn try_claim(&self, weights: &QueueWeights) -> Result<Option<DequeuedJob>, BrokerError> {
        let order: Vec<String> = {
            let mut rng = rand::thread_rng();
            weights
                .sampled_order(&mut rng)
                .into_iter()
                .map(str::to_string)
                .collect()
        };

        let mut conn = self.conn.clone();
        for queue in order {
            let id: Option<String> = redis::cmd("LPOP")
                .arg(queue_key(&queue))
                .query_async(&mut conn)
                .await
                .map_err(map_redis_err)?;
            let Some(id) = id else { continue };

            let (data, retry_count): (Option<String>, Option<u32>) = redis::cmd("HMGET")
                .arg(job_key(&id))
                .arg("data")
                .arg("retry_count")
                .query_async(&mut conn)
                .await
                .map_err(map_redis_err)?;
            let Some(data) = data else {
                debug!(job_id = %id, "queued job vanished before claim");
                continue;
            };

            let job: Job =
                serde_json::from_str(&data).map_err(|e| BrokerError::Decode(e.to_string()))?;

            let _: () = redis::cmd("HSET")
                .arg(job_key(&id))
                .arg("state")
                .arg("active")
                .query_async(&mut conn)
                .await
                .map_err(map_redis_err)?;

            return Ok(Some(DequeuedJob {
                job,
                retry_count: retry_count.unwrap_or(0),
            }));
        }

        Ok(None)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn ping(&self, timeout: Duration) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let cmd = redis::cmd("PING");
        let ping = cmd.query_async::<_, String>(&mut conn);
        match tokio::time::timeout(timeout, ping).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(map_redis_err(e)),
            Err(_) => Err(BrokerError::Unreachable(format!(
                "ping timed out after {timeout:?}"
            ))),
        }
    }

    async fn push(&self, job: &Job) -> Result<Uuid, BrokerError> {
        let id = self.store_job(job, "pending").await?;
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("RPUSH")
            .arg(queue_key(&job.queue))
            .arg(&id)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_err)?;
        Ok(job.id)
    }

    async fn push_delayed(
        &self,
        job: &Job,
        process_at: DateTime<Utc>,
    ) -> Result<Uuid, BrokerError> {
        let mut stored = job.clone();
        stored.process_at = Some(process_at);
        let id = self.store_job(&stored, "scheduled").await?;

        let mut conn = self.conn.clone();
        let _: () = redis::cmd("ZADD")
            .arg(SCHEDULED_KEY)
            .arg(process_at.timestamp_millis())
            .arg(&id)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_err)?;
        Ok(job.id)
    }

    async fn pop(
        &self,
        weights: &QueueWeights,
        timeout: Duration,
    ) -> Result<Option<DequeuedJob>, BrokerError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            self.promote_due(Utc::now()).await?;
            if let Some(dequeued) = self.try_claim(weights).await? {
                return Ok(Some(dequeued));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POP_POLL_STEP.min(deadline - now)).await;
        }
    }

    async fn ack(&self, job_id: Uuid) -> Result<(), BrokerError> {
        let id = self.assert_known(job_id).await?;
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(job_key(&id))
            .arg("state")
            .arg("completed")
            .ignore()
            .cmd("EXPIRE")
            .arg(job_key(&id))
            .arg(COMPLETED_TTL_SECS)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(map_redis_err)?;
        Ok(())
    }

    async fn retry(&self, job_id: Uuid, error: &str, delay: Duration) -> Result<(), BrokerError> {
        let id = self.assert_known(job_id).await?;
        let next_at = Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);

        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(job_key(&id))
            .arg("state")
            .arg("retrying")
            .arg("last_error")
            .arg(error)
            .arg("next_retry_at")
            .arg(next_at.timestamp_millis())
            .ignore()
            .cmd("HINCRBY")
            .arg(job_key(&id))
            .arg("retry_count")
            .arg(1)
            .ignore()
            .cmd("ZADD")
            .arg(SCHEDULED_KEY)
            .arg(next_at.timestamp_millis())
            .arg(&id)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(map_redis_err)?;
        Ok(())
    }

    async fn archive(&self, job_id: Uuid, error: &str) -> Result<(), BrokerError> {
        let id = self.assert_known(job_id).await?;
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(job_key(&id))
            .arg("state")
            .arg("archived")
            .arg("last_error")
            .arg(error)
            .ignore()
            .cmd("ZADD")
            .arg(ARCHIVED_KEY)
            .arg(Utc::now().timestamp_millis())
            .arg(&id)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(map_redis_err)?;
        Ok(())
    }
}

/// Connector producing a fresh Redis session per call
///
/// Handed to the supervisor so a broken session can be discarded and
/// replaced instead of retried in place.
#[derive(Debug, Clone)]
pub struct RedisConnector {
    url: String,
}

impl RedisConnector {
    /// Create a connector for the given Redis URL
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// The configured broker URL
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl BrokerConnector for RedisConnector {
    async fn connect(&self) -> Result<Arc<dyn Broker>, BrokerError> {
        let broker = RedisBroker::connect(&self.url).await?;
        Ok(Arc::new(broker))
    }
}
