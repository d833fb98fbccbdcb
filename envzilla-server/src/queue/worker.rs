//! Worker pool: reserves jobs, runs executors, translates outcomes into
//! queue acks/retries and record writes.
//!
//! Each worker is an independent loop; `JOB_CONCURRENCY` of them run in
//! parallel. A keepalive ticker refreshes the job's heartbeat during long
//! executor steps so the stall monitor does not re-deliver live work.
//! Every job runs under a deadline derived from its kind.

use envzilla_core::{ErrorKind, ExecError, JobKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{FailureDisposition, Job, JobQueue};
use crate::executor::{build, destroy, JobProgress};
use crate::sweeper;
use crate::AppState;

/// Idle poll interval when the queue is empty.
const POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Heartbeat refresh during long executor steps.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

pub fn spawn_workers(
    state: Arc<AppState>,
    count: usize,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    (0..count.max(1))
        .map(|index| {
            let state = state.clone();
            let cancel = cancel.clone();
            tokio::spawn(worker_loop(index, state, cancel))
        })
        .collect()
}

async fn worker_loop(index: usize, state: Arc<AppState>, cancel: CancellationToken) {
    info!("worker {index} started");
    loop {
        if cancel.is_cancelled() {
            break;
        }
        match state.queue.reserve().await {
            Ok(Some(job)) => {
                // In-flight jobs run to completion even during drain; the
                // cancel check above stops us taking new ones.
                process_job(state.clone(), job).await;
            }
            Ok(None) => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                }
            }
            Err(e) => {
                warn!("worker {index} failed to reserve: {e}");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(2)) => {}
                }
            }
        }
    }
    info!("worker {index} drained");
}

/// Runs one reserved job to a terminal queue state.
pub async fn process_job(state: Arc<AppState>, job: Job) {
    let progress = JobProgress::new(state.queue.clone(), job.id.clone());
    info!(
        "processing {} job {} (attempt {}/{}, delivery {})",
        job.kind,
        job.id,
        job.attempts,
        job.max_attempts,
        job.correlation_id.as_deref().unwrap_or("-")
    );

    let keepalive = {
        let progress = progress.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(KEEPALIVE_INTERVAL).await;
                progress.keepalive().await;
            }
        })
    };

    let deadline = job.kind.max_runtime();
    let outcome = match tokio::time::timeout(deadline, dispatch(state.clone(), &job, &progress))
        .await
    {
        Ok(outcome) => outcome,
        Err(_) => Err(ExecError::new(
            ErrorKind::Internal,
            format!("job deadline of {deadline:?} exceeded"),
        )),
    };
    keepalive.abort();

    match outcome {
        Ok(()) => {
            if let Err(e) = state.queue.complete(&job.id).await {
                warn!("completing job {} failed: {e}", job.id);
            }
            info!("{} job {} completed", job.kind, job.id);
        }
        Err(err) => handle_failure(&state, &job, err).await,
    }
}

async fn dispatch(state: Arc<AppState>, job: &Job, progress: &JobProgress) -> Result<(), ExecError> {
    match job.kind {
        JobKind::BuildContainer => {
            let payload = job
                .decode_payload()
                .map_err(|e| ExecError::new(ErrorKind::Internal, e.to_string()))?;
            build::execute(state, payload, progress).await
        }
        JobKind::DestroyContainer => {
            let payload = job
                .decode_payload()
                .map_err(|e| ExecError::new(ErrorKind::Internal, e.to_string()))?;
            destroy::execute(state, payload, progress).await
        }
        JobKind::CleanupStale => {
            let payload: envzilla_core::CleanupJobPayload = job
                .decode_payload()
                .map_err(|e| ExecError::new(ErrorKind::Internal, e.to_string()))?;
            let max_age = Duration::from_secs(payload.max_age_hours * 3600);
            sweeper::sweep_once(&state, max_age)
                .await
                .map(|reaped| {
                    info!("cleanup-stale reaped {reaped} deployments");
                })
                .map_err(|e| ExecError::new(ErrorKind::Internal, e.to_string()))
        }
    }
}

async fn handle_failure(state: &AppState, job: &Job, err: ExecError) {
    error!("{} job {} failed: {err}", job.kind, job.id);

    // Leave the failure on the record (the sweeper and re-dispatch paths
    // both read it). Jobs without a PR (cleanup) skip this.
    if let Some(pr_number) = job.payload.get("pr_number").and_then(|v| v.as_u64()) {
        if let Err(store_err) = state.store.mark_failed(pr_number, &err).await {
            warn!("could not mark pr {pr_number} failed: {store_err}");
        }
    }

    match state
        .queue
        .fail(&job.id, &err.to_string(), err.is_retryable())
        .await
    {
        Ok(FailureDisposition::Retry { delay, attempt }) => {
            info!(
                "{} job {} will retry (attempt {attempt} failed, backoff {delay:?})",
                job.kind, job.id
            );
        }
        Ok(FailureDisposition::DeadLetter) => {
            warn!("{} job {} dead-lettered: {err}", job.kind, job.id);
        }
        Err(queue_err) => error!("failing job {} failed: {queue_err}", job.id),
    }
}

/// Background stall monitor: re-delivers active jobs whose heartbeat went
/// quiet for longer than the configured window.
pub fn spawn_stall_monitor(
    queue: Arc<dyn JobQueue>,
    window: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = (window / 2).max(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    match queue.requeue_stalled(window).await {
                        Ok(0) => {}
                        Ok(count) => warn!("queue-stalled: re-delivered {count} jobs"),
                        Err(e) => warn!("stall sweep failed: {e}"),
                    }
                }
            }
        }
    })
}
