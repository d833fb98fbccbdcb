//! Durable at-least-once work queue for build/destroy jobs.
//!
//! Jobs are immutable after enqueue except for their attempt counter,
//! progress, and terminal result. Priorities are isolated namespaces
//! (lower number pops first); retries are scheduled with exponential
//! backoff; jobs that exhaust their attempts land in the dead-letter
//! history. Active jobs that stop heartbeating within the stall window
//! are re-delivered.
//!
//! The Redis backend is authoritative (jobs survive a controller
//! restart); the in-memory backend carries the test suite.

pub mod memory;
pub mod redis;
pub mod worker;

pub use memory::InMemoryJobQueue;
pub use redis::RedisJobQueue;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use envzilla_core::JobKind;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Default worker concurrency (`JOB_CONCURRENCY`).
pub const DEFAULT_CONCURRENCY: usize = 3;
/// Default attempts before dead-letter.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Completed-job history retained for inspection.
pub const COMPLETED_HISTORY: usize = 50;
/// Failed-job (dead-letter) history retained for inspection.
pub const FAILED_HISTORY: usize = 100;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue storage error: {0}")]
    Storage(String),
    #[error("unknown job: {0}")]
    UnknownJob(String),
    #[error("job payload error: {0}")]
    Payload(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Ready to be reserved.
    Waiting,
    /// Scheduled for a retry at `not_before`.
    Delayed,
    /// Reserved by a worker; kept alive by heartbeats.
    Active,
    Completed,
    /// Dead-lettered after exhausting attempts (or a non-retryable kind).
    Failed,
}

/// A queued unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub priority: u8,
    pub payload: serde_json::Value,
    pub state: JobState,
    /// Times this job has been handed to a worker.
    pub attempts: u32,
    pub max_attempts: u32,
    pub progress: u8,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Earliest time a delayed job may be promoted back to waiting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl Job {
    pub fn new<P: Serialize>(
        kind: JobKind,
        payload: &P,
        max_attempts: u32,
        correlation_id: Option<String>,
    ) -> Result<Self, QueueError> {
        let payload =
            serde_json::to_value(payload).map_err(|e| QueueError::Payload(e.to_string()))?;
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            kind,
            priority: kind.priority(),
            payload,
            state: JobState::Waiting,
            attempts: 0,
            max_attempts,
            progress: 0,
            enqueued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            not_before: None,
            last_heartbeat: None,
            last_error: None,
            correlation_id,
        })
    }

    pub fn decode_payload<P: serde::de::DeserializeOwned>(&self) -> Result<P, QueueError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            QueueError::Payload(format!("{} payload does not decode: {e}", self.kind))
        })
    }
}

/// Retry schedule: exponential backoff from `base`, multiplied per
/// attempt, capped.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base: Duration,
    pub multiplier: f64,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            multiplier: 2.0,
            cap: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before re-running a job that has already made `attempt`
    /// attempts (1-based): 2 s, 4 s, 8 s, ... up to the cap.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(24);
        let factor = self.multiplier.powi(exp as i32);
        let delay = self.base.mul_f64(factor);
        delay.min(self.cap)
    }
}

/// What the queue decided to do with a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Re-delivery scheduled after the backoff delay.
    Retry { delay: Duration, attempt: u32 },
    /// Attempts exhausted (or kind non-retryable): dead-lettered.
    DeadLetter,
}

/// Counts per queue state, served at `/admin/queue/stats`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: usize,
    pub delayed: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

/// The queue contract shared by the Redis and in-memory backends.
///
/// Delivery is at-least-once: a reservation that is never completed or
/// failed is eventually re-delivered by `requeue_stalled`.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Adds the job in state `Waiting`. Returns the job id.
    async fn enqueue(&self, job: Job) -> Result<String, QueueError>;

    /// Pops the highest-priority ready job, promoting due retries first.
    /// The returned job is `Active` with its attempt counter bumped.
    async fn reserve(&self) -> Result<Option<Job>, QueueError>;

    /// Progress heartbeat (0-100) from the worker processing `job_id`.
    async fn heartbeat(&self, job_id: &str, progress: u8) -> Result<(), QueueError>;

    async fn complete(&self, job_id: &str) -> Result<(), QueueError>;

    /// Records a failed attempt and either schedules a retry or
    /// dead-letters the job.
    async fn fail(
        &self,
        job_id: &str,
        error: &str,
        retryable: bool,
    ) -> Result<FailureDisposition, QueueError>;

    async fn get(&self, job_id: &str) -> Result<Option<Job>, QueueError>;

    async fn stats(&self) -> Result<QueueStats, QueueError>;

    /// Re-delivers active jobs whose last heartbeat is older than
    /// `stalled_after`. Returns how many were re-queued.
    async fn requeue_stalled(&self, stalled_after: Duration) -> Result<usize, QueueError>;
}
