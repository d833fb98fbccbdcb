//! Job executors.
//!
//! Executors return typed outcomes: `Ok(())` with all store writes done,
//! or an [`ExecError`](envzilla_core::ExecError) carrying a classified
//! kind. Nothing panics across the queue boundary; the worker layer
//! translates outcomes into queue acks/retries and record writes.

pub mod build;
pub mod destroy;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::warn;

use crate::queue::JobQueue;

/// Progress handle given to an executor: publishes 0-100 heartbeats for
/// the job being processed. Heartbeats double as the queue's liveness
/// signal, so a long step should still tick via [`JobProgress::keepalive`].
#[derive(Clone)]
pub struct JobProgress {
    queue: Arc<dyn JobQueue>,
    job_id: String,
    last: Arc<AtomicU8>,
}

impl JobProgress {
    pub fn new(queue: Arc<dyn JobQueue>, job_id: String) -> Self {
        Self {
            queue,
            job_id,
            last: Arc::new(AtomicU8::new(0)),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub async fn report(&self, percent: u8) {
        let percent = percent.min(100);
        self.last.store(percent, Ordering::Relaxed);
        if let Err(e) = self.queue.heartbeat(&self.job_id, percent).await {
            warn!("progress heartbeat for job {} failed: {e}", self.job_id);
        }
    }

    /// Re-sends the last reported progress, refreshing the stall window
    /// without claiming forward movement.
    pub async fn keepalive(&self) {
        let last = self.last.load(Ordering::Relaxed);
        if let Err(e) = self.queue.heartbeat(&self.job_id, last).await {
            warn!("keepalive heartbeat for job {} failed: {e}", self.job_id);
        }
    }
}
