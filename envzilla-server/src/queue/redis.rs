//! Redis-backed implementation of `JobQueue`.
//!
//! Layout (all under the queue's own prefix, not exposed externally):
//!
//! - `envzilla:jobs:<id>`          JSON job record
//! - `envzilla:queue:waiting:<p>`  FIFO list per priority namespace
//! - `envzilla:queue:delayed`      zset scored by ready-at (unix millis)
//! - `envzilla:queue:active`       zset scored by last heartbeat (millis)
//! - `envzilla:queue:completed`    id list trimmed to the history cap
//! - `envzilla:queue:failed`       id list trimmed to the history cap
//!
//! Jobs survive a controller restart: anything left in `active` at boot
//! stops heartbeating and is re-delivered by the stall monitor.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;

use super::{
    FailureDisposition, Job, JobQueue, JobState, QueueError, QueueStats, RetryPolicy,
    COMPLETED_HISTORY, FAILED_HISTORY,
};

const JOB_PREFIX: &str = "envzilla:jobs:";
const WAITING_PREFIX: &str = "envzilla:queue:waiting:";
const DELAYED_KEY: &str = "envzilla:queue:delayed";
const ACTIVE_KEY: &str = "envzilla:queue:active";
const COMPLETED_KEY: &str = "envzilla:queue:completed";
const FAILED_KEY: &str = "envzilla:queue:failed";

/// Priority namespaces polled by `reserve`, in pop order.
const PRIORITIES: [u8; 3] = [1, 2, 3];

/// Retained job records expire on their own after a week even if history
/// trimming never evicts them.
const JOB_TTL_SECS: u64 = 7 * 24 * 3600;

pub struct RedisJobQueue {
    conn: ConnectionManager,
    retry: RetryPolicy,
}

impl RedisJobQueue {
    pub fn new(conn: ConnectionManager, retry: RetryPolicy) -> Self {
        Self { conn, retry }
    }

    fn job_key(id: &str) -> String {
        format!("{JOB_PREFIX}{id}")
    }

    fn waiting_key(priority: u8) -> String {
        format!("{WAITING_PREFIX}{priority}")
    }

    fn storage<E: std::fmt::Display>(err: E) -> QueueError {
        QueueError::Storage(err.to_string())
    }

    async fn load(&self, conn: &mut ConnectionManager, id: &str) -> Result<Job, QueueError> {
        let raw: Option<String> = conn.get(Self::job_key(id)).await.map_err(Self::storage)?;
        let json = raw.ok_or_else(|| QueueError::UnknownJob(id.to_string()))?;
        serde_json::from_str(&json)
            .map_err(|e| QueueError::Storage(format!("corrupt job {id}: {e}")))
    }

    async fn save(&self, conn: &mut ConnectionManager, job: &Job) -> Result<(), QueueError> {
        let json = serde_json::to_string(job).map_err(Self::storage)?;
        conn.set_ex::<_, _, ()>(Self::job_key(&job.id), json, JOB_TTL_SECS)
            .await
            .map_err(Self::storage)
    }

    /// Move delayed jobs whose ready-time has passed back into their
    /// priority lane.
    async fn promote_due(&self, conn: &mut ConnectionManager) -> Result<(), QueueError> {
        let now_ms = Utc::now().timestamp_millis();
        let due: Vec<String> = conn
            .zrangebyscore(DELAYED_KEY, 0i64, now_ms)
            .await
            .map_err(Self::storage)?;
        for id in due {
            let removed: i64 = conn
                .zrem(DELAYED_KEY, &id)
                .await
                .map_err(Self::storage)?;
            if removed == 0 {
                // Another replica promoted it first.
                continue;
            }
            match self.load(conn, &id).await {
                Ok(mut job) => {
                    job.state = JobState::Waiting;
                    job.not_before = None;
                    self.save(conn, &job).await?;
                    conn.rpush::<_, _, ()>(Self::waiting_key(job.priority), &id)
                        .await
                        .map_err(Self::storage)?;
                }
                Err(QueueError::UnknownJob(_)) => {
                    tracing::warn!("delayed job {id} has no record, dropping");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, job: Job) -> Result<String, QueueError> {
        let mut conn = self.conn.clone();
        let id = job.id.clone();
        self.save(&mut conn, &job).await?;
        conn.rpush::<_, _, ()>(Self::waiting_key(job.priority), &id)
            .await
            .map_err(Self::storage)?;
        Ok(id)
    }

    async fn reserve(&self) -> Result<Option<Job>, QueueError> {
        let mut conn = self.conn.clone();
        self.promote_due(&mut conn).await?;

        for priority in PRIORITIES {
            let popped: Option<String> = conn
                .lpop(Self::waiting_key(priority), None)
                .await
                .map_err(Self::storage)?;
            let Some(id) = popped else { continue };

            let mut job = match self.load(&mut conn, &id).await {
                Ok(job) => job,
                Err(QueueError::UnknownJob(_)) => {
                    tracing::warn!("waiting job {id} has no record, dropping");
                    continue;
                }
                Err(e) => return Err(e),
            };
            let now = Utc::now();
            job.state = JobState::Active;
            job.attempts += 1;
            job.started_at = Some(now);
            job.last_heartbeat = Some(now);
            job.progress = 0;
            self.save(&mut conn, &job).await?;
            conn.zadd::<_, _, _, ()>(ACTIVE_KEY, &id, now.timestamp_millis())
                .await
                .map_err(Self::storage)?;
            return Ok(Some(job));
        }
        Ok(None)
    }

    async fn heartbeat(&self, job_id: &str, progress: u8) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let mut job = self.load(&mut conn, job_id).await?;
        let now = Utc::now();
        job.progress = progress.min(100);
        job.last_heartbeat = Some(now);
        self.save(&mut conn, &job).await?;
        conn.zadd::<_, _, _, ()>(ACTIVE_KEY, job_id, now.timestamp_millis())
            .await
            .map_err(Self::storage)
    }

    async fn complete(&self, job_id: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let mut job = self.load(&mut conn, job_id).await?;
        job.state = JobState::Completed;
        job.progress = 100;
        job.finished_at = Some(Utc::now());
        self.save(&mut conn, &job).await?;

        conn.zrem::<_, _, ()>(ACTIVE_KEY, job_id)
            .await
            .map_err(Self::storage)?;
        conn.lpush::<_, _, ()>(COMPLETED_KEY, job_id)
            .await
            .map_err(Self::storage)?;
        conn.ltrim::<_, ()>(COMPLETED_KEY, 0, COMPLETED_HISTORY as isize - 1)
            .await
            .map_err(Self::storage)
    }

    async fn fail(
        &self,
        job_id: &str,
        error: &str,
        retryable: bool,
    ) -> Result<FailureDisposition, QueueError> {
        let mut conn = self.conn.clone();
        let mut job = self.load(&mut conn, job_id).await?;
        job.last_error = Some(error.to_string());
        conn.zrem::<_, _, ()>(ACTIVE_KEY, job_id)
            .await
            .map_err(Self::storage)?;

        if retryable && job.attempts < job.max_attempts {
            let attempt = job.attempts;
            let delay = self.retry.delay_for_attempt(attempt);
            let ready_at = Utc::now()
                + ChronoDuration::from_std(delay).unwrap_or(ChronoDuration::seconds(2));
            job.state = JobState::Delayed;
            job.not_before = Some(ready_at);
            self.save(&mut conn, &job).await?;
            conn.zadd::<_, _, _, ()>(DELAYED_KEY, job_id, ready_at.timestamp_millis())
                .await
                .map_err(Self::storage)?;
            Ok(FailureDisposition::Retry { delay, attempt })
        } else {
            job.state = JobState::Failed;
            job.finished_at = Some(Utc::now());
            self.save(&mut conn, &job).await?;
            conn.lpush::<_, _, ()>(FAILED_KEY, job_id)
                .await
                .map_err(Self::storage)?;
            conn.ltrim::<_, ()>(FAILED_KEY, 0, FAILED_HISTORY as isize - 1)
                .await
                .map_err(Self::storage)?;
            Ok(FailureDisposition::DeadLetter)
        }
    }

    async fn get(&self, job_id: &str) -> Result<Option<Job>, QueueError> {
        let mut conn = self.conn.clone();
        match self.load(&mut conn, job_id).await {
            Ok(job) => Ok(Some(job)),
            Err(QueueError::UnknownJob(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut conn = self.conn.clone();
        let mut stats = QueueStats::default();
        for priority in PRIORITIES {
            let len: usize = conn
                .llen(Self::waiting_key(priority))
                .await
                .map_err(Self::storage)?;
            stats.waiting += len;
        }
        stats.delayed = conn.zcard(DELAYED_KEY).await.map_err(Self::storage)?;
        stats.active = conn.zcard(ACTIVE_KEY).await.map_err(Self::storage)?;
        stats.completed = conn.llen(COMPLETED_KEY).await.map_err(Self::storage)?;
        stats.failed = conn.llen(FAILED_KEY).await.map_err(Self::storage)?;
        Ok(stats)
    }

    async fn requeue_stalled(&self, stalled_after: Duration) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let cutoff_ms = (Utc::now()
            - ChronoDuration::from_std(stalled_after).unwrap_or(ChronoDuration::seconds(30)))
        .timestamp_millis();

        let stalled: Vec<String> = conn
            .zrangebyscore(ACTIVE_KEY, 0i64, cutoff_ms)
            .await
            .map_err(Self::storage)?;

        let mut redelivered = 0usize;
        for id in stalled {
            let removed: i64 = conn.zrem(ACTIVE_KEY, &id).await.map_err(Self::storage)?;
            if removed == 0 {
                continue;
            }
            match self.load(&mut conn, &id).await {
                Ok(mut job) => {
                    job.state = JobState::Waiting;
                    job.last_error =
                        Some("queue-stalled: no heartbeat within window".to_string());
                    self.save(&mut conn, &job).await?;
                    conn.rpush::<_, _, ()>(Self::waiting_key(job.priority), &id)
                        .await
                        .map_err(Self::storage)?;
                    redelivered += 1;
                }
                Err(QueueError::UnknownJob(_)) => {
                    tracing::warn!("stalled job {id} has no record, dropping");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(redelivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout_is_stable() {
        assert_eq!(RedisJobQueue::job_key("abc"), "envzilla:jobs:abc");
        assert_eq!(RedisJobQueue::waiting_key(1), "envzilla:queue:waiting:1");
    }
}
