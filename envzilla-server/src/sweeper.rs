//! Stale-deployment sweeper and boot-time recovery.
//!
//! The sweeper scans the store on an interval and promotes records older
//! than the age threshold to `destroying`, enqueueing a destroy job for
//! each. Recovery runs once at startup: records left in `building` or
//! `destroying` by a crash are marked failed so the next PR event (or the
//! sweeper) can pick them up.

use chrono::{Duration as ChronoDuration, Utc};
use envzilla_core::{DeploymentStatus, DestroyJobPayload, ErrorKind, ExecError, JobKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::queue::{Job, JobQueue};
use crate::store::StoreError;
use crate::AppState;

/// One sweep: every record whose last update is older than `max_age` is
/// transitioned to `destroying` and handed a destroy job. Returns how
/// many records were promoted.
pub async fn sweep_once(state: &AppState, max_age: Duration) -> Result<usize, StoreError> {
    let threshold =
        ChronoDuration::from_std(max_age).unwrap_or_else(|_| ChronoDuration::hours(24));
    let now = Utc::now();
    let mut reaped = 0usize;

    for record in state.store.list().await? {
        if record.status == DeploymentStatus::Destroying {
            continue; // already on its way out
        }
        if record.age_since_update(now) <= threshold {
            continue;
        }

        let pr_number = record.pr_number;
        match state
            .store
            .transition(pr_number, DeploymentStatus::Destroying, |_| {})
            .await
        {
            Ok(_) => {}
            Err(e) => {
                // Lost a race with a live event for this PR; leave it be.
                warn!("sweeper skipped pr {pr_number}: {e}");
                continue;
            }
        }

        let payload = DestroyJobPayload {
            pr_number,
            container_id: record.container_id.clone(),
            remove_images: true,
        };
        let job = match Job::new(
            JobKind::DestroyContainer,
            &payload,
            state.config.job_max_attempts,
            None,
        ) {
            Ok(job) => job,
            Err(e) => {
                warn!("sweeper could not build destroy job for pr {pr_number}: {e}");
                continue;
            }
        };
        match state.queue.enqueue(job).await {
            Ok(job_id) => {
                info!(
                    "sweeper reaping pr {pr_number} (stale {}h) via job {job_id}",
                    record.age_since_update(now).num_hours()
                );
                reaped += 1;
            }
            Err(e) => warn!("sweeper could not enqueue destroy for pr {pr_number}: {e}"),
        }
    }
    Ok(reaped)
}

/// Periodic sweep loop (every `sweep_interval`, default 6 h).
pub fn spawn_sweeper(state: Arc<AppState>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(state.config.sweep_interval) => {
                    match sweep_once(&state, state.config.sweep_max_age).await {
                        Ok(0) => {}
                        Ok(reaped) => info!("sweeper reaped {reaped} stale deployments"),
                        Err(e) => warn!("sweep failed: {e}"),
                    }
                }
            }
        }
    })
}

/// Boot-time recovery: a crash can leave records stuck mid-flight. They
/// are marked failed (with an explanatory error) so normal dispatch can
/// requeue or destroy them.
pub async fn recover_orphans(state: &AppState) -> Result<usize, StoreError> {
    let mut recovered = 0usize;
    for record in state.store.list().await? {
        if !matches!(
            record.status,
            DeploymentStatus::Building | DeploymentStatus::Destroying
        ) {
            continue;
        }
        let err = ExecError::new(
            ErrorKind::Internal,
            format!(
                "orphaned in {} by a controller restart",
                record.status
            ),
        );
        match state.store.mark_failed(record.pr_number, &err).await {
            Ok(_) => {
                info!(
                    "recovered orphaned pr {} (was {})",
                    record.pr_number, record.status
                );
                recovered += 1;
            }
            Err(e) => warn!("could not recover pr {}: {e}", record.pr_number),
        }
    }
    Ok(recovered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::queue::{InMemoryJobQueue, JobQueue};
    use crate::store::InMemoryDeploymentRepository;
    use envzilla_core::PrMetadata;

    fn test_state() -> Arc<AppState> {
        let dir = std::env::temp_dir();
        let mut config = Config::test_defaults(&dir);
        config.job_max_attempts = 3;
        Arc::new(AppState::new(
            config,
            Arc::new(InMemoryDeploymentRepository::new()),
            Arc::new(InMemoryJobQueue::default()),
        ))
    }

    fn meta() -> PrMetadata {
        PrMetadata {
            branch: "feat/x".into(),
            commit_sha: "abc123".into(),
            title: "x".into(),
            author: "octocat".into(),
            repo_full_name: "example/repo".into(),
            clone_url: "https://example.test/u/r.git".into(),
        }
    }

    async fn backdate(state: &AppState, pr: u64, hours: i64) {
        let status = state.store.get(pr).await.unwrap().unwrap().status;
        state
            .store
            .transition(pr, status, move |rec| {
                rec.updated_at = Utc::now() - ChronoDuration::hours(hours);
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn sweeper_only_promotes_stale_records() {
        let state = test_state();
        state.store.upsert_queued(1, meta()).await.unwrap();
        state.store.upsert_queued(2, meta()).await.unwrap();
        backdate(&state, 1, 25).await;

        let reaped = sweep_once(&state, Duration::from_secs(24 * 3600))
            .await
            .unwrap();
        assert_eq!(reaped, 1);

        let stale = state.store.get(1).await.unwrap().unwrap();
        assert_eq!(stale.status, DeploymentStatus::Destroying);
        let fresh = state.store.get(2).await.unwrap().unwrap();
        assert_eq!(fresh.status, DeploymentStatus::Queued);

        // A destroy job was enqueued for the stale record only.
        let stats = state.queue.stats().await.unwrap();
        assert_eq!(stats.waiting, 1);
    }

    #[tokio::test]
    async fn sweeper_ignores_records_already_destroying() {
        let state = test_state();
        state.store.upsert_queued(1, meta()).await.unwrap();
        state
            .store
            .transition(1, DeploymentStatus::Destroying, |_| {})
            .await
            .unwrap();
        backdate(&state, 1, 48).await;

        let reaped = sweep_once(&state, Duration::from_secs(24 * 3600))
            .await
            .unwrap();
        assert_eq!(reaped, 0);
        assert_eq!(state.queue.stats().await.unwrap().waiting, 0);
    }

    #[tokio::test]
    async fn recovery_marks_in_flight_records_failed() {
        let state = test_state();
        state.store.upsert_queued(1, meta()).await.unwrap();
        state
            .store
            .transition(1, DeploymentStatus::Building, |_| {})
            .await
            .unwrap();
        state.store.upsert_queued(2, meta()).await.unwrap();

        let recovered = recover_orphans(&state).await.unwrap();
        assert_eq!(recovered, 1);

        let orphan = state.store.get(1).await.unwrap().unwrap();
        assert_eq!(orphan.status, DeploymentStatus::Failed);
        assert!(orphan.last_error.as_deref().unwrap().starts_with("internal"));
        assert_eq!(
            state.store.get(2).await.unwrap().unwrap().status,
            DeploymentStatus::Queued
        );
    }
}
