//! In-memory implementation of `JobQueue`.
//!
//! Single-process, lost on restart. Semantics (priorities, backoff,
//! dead-letter, stall re-delivery) match the Redis backend so tests can
//! exercise the worker pipeline without a broker.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use super::{
    FailureDisposition, Job, JobQueue, JobState, QueueError, QueueStats, RetryPolicy,
    COMPLETED_HISTORY, FAILED_HISTORY,
};

struct Inner {
    jobs: HashMap<String, Job>,
    /// One FIFO lane per priority; lower priority number pops first.
    waiting: Vec<(u8, VecDeque<String>)>,
    completed_order: VecDeque<String>,
    failed_order: VecDeque<String>,
}

pub struct InMemoryJobQueue {
    inner: Mutex<Inner>,
    retry: RetryPolicy,
}

impl InMemoryJobQueue {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner {
                jobs: HashMap::new(),
                waiting: Vec::new(),
                completed_order: VecDeque::new(),
                failed_order: VecDeque::new(),
            }),
            retry,
        }
    }
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl Inner {
    fn lane(&mut self, priority: u8) -> &mut VecDeque<String> {
        let pos = match self.waiting.binary_search_by_key(&priority, |(p, _)| *p) {
            Ok(pos) => pos,
            Err(pos) => {
                self.waiting.insert(pos, (priority, VecDeque::new()));
                pos
            }
        };
        &mut self.waiting[pos].1
    }

    /// Move due delayed jobs back into their priority lane.
    fn promote_due(&mut self) {
        let now = Utc::now();
        let due: Vec<String> = self
            .jobs
            .values()
            .filter(|job| {
                job.state == JobState::Delayed && job.not_before.is_none_or(|t| t <= now)
            })
            .map(|job| job.id.clone())
            .collect();
        for id in due {
            if let Some(job) = self.jobs.get_mut(&id) {
                job.state = JobState::Waiting;
                job.not_before = None;
                let priority = job.priority;
                self.lane(priority).push_back(id);
            }
        }
    }

    fn trim_history(&mut self) {
        while self.completed_order.len() > COMPLETED_HISTORY {
            if let Some(id) = self.completed_order.pop_front() {
                self.jobs.remove(&id);
            }
        }
        while self.failed_order.len() > FAILED_HISTORY {
            if let Some(id) = self.failed_order.pop_front() {
                self.jobs.remove(&id);
            }
        }
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job: Job) -> Result<String, QueueError> {
        let mut inner = self.inner.lock().expect("queue poisoned");
        let id = job.id.clone();
        let priority = job.priority;
        inner.jobs.insert(id.clone(), job);
        inner.lane(priority).push_back(id.clone());
        Ok(id)
    }

    async fn reserve(&self) -> Result<Option<Job>, QueueError> {
        let mut inner = self.inner.lock().expect("queue poisoned");
        inner.promote_due();

        let mut reserved_id = None;
        for (_, lane) in inner.waiting.iter_mut() {
            if let Some(id) = lane.pop_front() {
                reserved_id = Some(id);
                break;
            }
        }
        let Some(id) = reserved_id else {
            return Ok(None);
        };

        let job = inner
            .jobs
            .get_mut(&id)
            .ok_or_else(|| QueueError::UnknownJob(id.clone()))?;
        let now = Utc::now();
        job.state = JobState::Active;
        job.attempts += 1;
        job.started_at = Some(now);
        job.last_heartbeat = Some(now);
        job.progress = 0;
        Ok(Some(job.clone()))
    }

    async fn heartbeat(&self, job_id: &str, progress: u8) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().expect("queue poisoned");
        let job = inner
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| QueueError::UnknownJob(job_id.to_string()))?;
        job.progress = progress.min(100);
        job.last_heartbeat = Some(Utc::now());
        Ok(())
    }

    async fn complete(&self, job_id: &str) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().expect("queue poisoned");
        let job = inner
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| QueueError::UnknownJob(job_id.to_string()))?;
        job.state = JobState::Completed;
        job.progress = 100;
        job.finished_at = Some(Utc::now());
        inner.completed_order.push_back(job_id.to_string());
        inner.trim_history();
        Ok(())
    }

    async fn fail(
        &self,
        job_id: &str,
        error: &str,
        retryable: bool,
    ) -> Result<FailureDisposition, QueueError> {
        let mut inner = self.inner.lock().expect("queue poisoned");
        let retry = self.retry;
        let job = inner
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| QueueError::UnknownJob(job_id.to_string()))?;
        job.last_error = Some(error.to_string());

        if retryable && job.attempts < job.max_attempts {
            let attempt = job.attempts;
            let delay = retry.delay_for_attempt(attempt);
            job.state = JobState::Delayed;
            job.not_before = Some(
                Utc::now()
                    + ChronoDuration::from_std(delay).unwrap_or(ChronoDuration::seconds(2)),
            );
            Ok(FailureDisposition::Retry { delay, attempt })
        } else {
            job.state = JobState::Failed;
            job.finished_at = Some(Utc::now());
            inner.failed_order.push_back(job_id.to_string());
            inner.trim_history();
            Ok(FailureDisposition::DeadLetter)
        }
    }

    async fn get(&self, job_id: &str) -> Result<Option<Job>, QueueError> {
        let inner = self.inner.lock().expect("queue poisoned");
        Ok(inner.jobs.get(job_id).cloned())
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let inner = self.inner.lock().expect("queue poisoned");
        let mut stats = QueueStats::default();
        for job in inner.jobs.values() {
            match job.state {
                JobState::Waiting => stats.waiting += 1,
                JobState::Delayed => stats.delayed += 1,
                JobState::Active => stats.active += 1,
                JobState::Completed => stats.completed += 1,
                JobState::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    async fn requeue_stalled(&self, stalled_after: Duration) -> Result<usize, QueueError> {
        let mut inner = self.inner.lock().expect("queue poisoned");
        let cutoff = Utc::now()
            - ChronoDuration::from_std(stalled_after).unwrap_or(ChronoDuration::seconds(30));

        let stalled: Vec<String> = inner
            .jobs
            .values()
            .filter(|job| {
                job.state == JobState::Active && job.last_heartbeat.is_none_or(|hb| hb < cutoff)
            })
            .map(|job| job.id.clone())
            .collect();

        for id in &stalled {
            if let Some(job) = inner.jobs.get_mut(id) {
                job.state = JobState::Waiting;
                job.last_error = Some("queue-stalled: no heartbeat within window".to_string());
                let priority = job.priority;
                inner.lane(priority).push_back(id.clone());
            }
        }
        Ok(stalled.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use envzilla_core::{CleanupJobPayload, DestroyJobPayload, JobKind};
    use std::time::Duration;

    fn build_job() -> Job {
        // Payload shape is irrelevant to queue mechanics.
        Job::new(
            JobKind::BuildContainer,
            &CleanupJobPayload { max_age_hours: 1 },
            3,
            None,
        )
        .unwrap()
    }

    fn destroy_job() -> Job {
        Job::new(
            JobKind::DestroyContainer,
            &DestroyJobPayload {
                pr_number: 42,
                container_id: Some("abc123def456".into()),
                remove_images: true,
            },
            3,
            None,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn reserve_returns_none_on_empty_queue() {
        let queue = InMemoryJobQueue::default();
        assert!(queue.reserve().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lower_priority_number_pops_first() {
        let queue = InMemoryJobQueue::default();
        let destroy = queue.enqueue(destroy_job()).await.unwrap();
        let build = queue.enqueue(build_job()).await.unwrap();

        // Build is priority 1, destroy priority 2.
        assert_eq!(queue.reserve().await.unwrap().unwrap().id, build);
        assert_eq!(queue.reserve().await.unwrap().unwrap().id, destroy);
    }

    #[tokio::test]
    async fn fifo_within_a_priority() {
        let queue = InMemoryJobQueue::default();
        let a = queue.enqueue(build_job()).await.unwrap();
        let b = queue.enqueue(build_job()).await.unwrap();
        assert_eq!(queue.reserve().await.unwrap().unwrap().id, a);
        assert_eq!(queue.reserve().await.unwrap().unwrap().id, b);
    }

    #[tokio::test]
    async fn reserve_bumps_attempts_and_activates() {
        let queue = InMemoryJobQueue::default();
        queue.enqueue(build_job()).await.unwrap();
        let job = queue.reserve().await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Active);
        assert_eq!(job.attempts, 1);
        assert!(job.started_at.is_some());
    }

    #[tokio::test]
    async fn retryable_failure_is_delayed_then_promoted() {
        let retry = RetryPolicy {
            base: Duration::from_millis(10),
            multiplier: 2.0,
            cap: Duration::from_millis(40),
        };
        let queue = InMemoryJobQueue::new(retry);
        let id = queue.enqueue(build_job()).await.unwrap();
        queue.reserve().await.unwrap().unwrap();

        let disposition = queue.fail(&id, "clone-failed: timeout", true).await.unwrap();
        assert!(matches!(
            disposition,
            FailureDisposition::Retry { attempt: 1, .. }
        ));

        // Not due yet.
        assert!(queue.reserve().await.unwrap().is_none());
        tokio::time::sleep(Duration::from_millis(30)).await;
        let retried = queue.reserve().await.unwrap().unwrap();
        assert_eq!(retried.id, id);
        assert_eq!(retried.attempts, 2);
    }

    #[tokio::test]
    async fn third_failed_attempt_dead_letters() {
        let retry = RetryPolicy {
            base: Duration::from_millis(1),
            multiplier: 2.0,
            cap: Duration::from_millis(2),
        };
        let queue = InMemoryJobQueue::new(retry);
        let id = queue.enqueue(build_job()).await.unwrap();

        for attempt in 1..=3u32 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let job = queue.reserve().await.unwrap().unwrap();
            assert_eq!(job.attempts, attempt);
            let disposition = queue.fail(&id, "build-failed: boom", true).await.unwrap();
            if attempt < 3 {
                assert!(matches!(disposition, FailureDisposition::Retry { .. }));
            } else {
                assert_eq!(disposition, FailureDisposition::DeadLetter);
            }
        }

        let job = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.last_error.as_deref(), Some("build-failed: boom"));
        assert!(queue.reserve().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn non_retryable_failure_dead_letters_immediately() {
        let queue = InMemoryJobQueue::default();
        let id = queue.enqueue(destroy_job()).await.unwrap();
        queue.reserve().await.unwrap().unwrap();

        let disposition = queue
            .fail(&id, "decrypt-error: integrity check failed", false)
            .await
            .unwrap();
        assert_eq!(disposition, FailureDisposition::DeadLetter);
        assert_eq!(
            queue.get(&id).await.unwrap().unwrap().state,
            JobState::Failed
        );
    }

    #[tokio::test]
    async fn stalled_active_job_is_redelivered() {
        let queue = InMemoryJobQueue::default();
        let id = queue.enqueue(build_job()).await.unwrap();
        queue.reserve().await.unwrap().unwrap();

        // Heartbeat is fresh: nothing to do.
        assert_eq!(
            queue.requeue_stalled(Duration::from_secs(60)).await.unwrap(),
            0
        );
        // Zero-width window: everything active is stalled.
        assert_eq!(
            queue.requeue_stalled(Duration::from_secs(0)).await.unwrap(),
            1
        );
        let job = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Waiting);
        assert!(job
            .last_error
            .as_deref()
            .unwrap()
            .starts_with("queue-stalled"));

        // And it can be reserved again.
        assert_eq!(queue.reserve().await.unwrap().unwrap().id, id);
    }

    #[tokio::test]
    async fn heartbeat_updates_progress() {
        let queue = InMemoryJobQueue::default();
        let id = queue.enqueue(build_job()).await.unwrap();
        queue.reserve().await.unwrap().unwrap();
        queue.heartbeat(&id, 40).await.unwrap();
        assert_eq!(queue.get(&id).await.unwrap().unwrap().progress, 40);
        // Progress is clamped to 100.
        queue.heartbeat(&id, 250).await.unwrap();
        assert_eq!(queue.get(&id).await.unwrap().unwrap().progress, 100);
    }

    #[tokio::test]
    async fn completed_history_is_trimmed() {
        let queue = InMemoryJobQueue::default();
        let mut first_id = None;
        for _ in 0..(COMPLETED_HISTORY + 5) {
            let id = queue.enqueue(build_job()).await.unwrap();
            first_id.get_or_insert(id.clone());
            queue.reserve().await.unwrap().unwrap();
            queue.complete(&id).await.unwrap();
        }
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.completed, COMPLETED_HISTORY);
        // The oldest completed job has been dropped entirely.
        assert!(queue.get(&first_id.unwrap()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stats_track_states() {
        let queue = InMemoryJobQueue::default();
        queue.enqueue(build_job()).await.unwrap();
        let active = queue.enqueue(build_job()).await.unwrap();
        queue.enqueue(destroy_job()).await.unwrap();

        // Reserve pops the first build job.
        let reserved = queue.reserve().await.unwrap().unwrap();
        assert_ne!(reserved.id, active); // FIFO: first enqueued pops first

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.active, 1);
        assert_eq!(stats.waiting, 2);
        assert_eq!(stats.completed, 0);
    }
}
