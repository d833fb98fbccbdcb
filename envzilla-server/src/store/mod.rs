//! Deployment store: the authoritative per-PR record with guarded writes.
//!
//! Storage is abstracted behind [`DeploymentRepository`] so the state
//! machine logic is backend-independent. The Redis implementation is
//! authoritative in production; the in-memory implementation backs tests
//! and single-node development.
//!
//! Writers never clobber: every status change goes through a
//! compare-and-set on the observed status, so a later event for a PR
//! cannot corrupt an in-flight build.

mod memory;
mod redis;

pub use memory::InMemoryDeploymentRepository;
pub use redis::RedisDeploymentRepository;

use async_trait::async_trait;
use chrono::Utc;
use envzilla_core::{DeploymentRecord, DeploymentStatus, ExecError, PrMetadata};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// How many times a guarded write is retried after losing a race before
/// the store gives up with `state-conflict`.
const CAS_RETRIES: usize = 3;

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The observed status is not a legal predecessor of the requested one.
    #[error("state-conflict: pr {pr_number} cannot move {from:?} -> {to}")]
    Conflict {
        pr_number: u64,
        from: Option<DeploymentStatus>,
        to: DeploymentStatus,
    },
    #[error("no deployment record for pr {0}")]
    NotFound(u64),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Storage backend for deployment records.
///
/// `put_if_status` is the only write primitive: it stores `record` only
/// when the currently stored status matches `expected` (`None` meaning no
/// record exists), returning `false` when the guard fails. This is what
/// makes the store's compare-and-set loop work on any backend.
#[async_trait]
pub trait DeploymentRepository: Send + Sync {
    async fn get(&self, pr_number: u64) -> Result<Option<DeploymentRecord>, StoreError>;

    async fn put_if_status(
        &self,
        expected: Option<DeploymentStatus>,
        record: &DeploymentRecord,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Returns `true` when a record was deleted.
    async fn delete(&self, pr_number: u64) -> Result<bool, StoreError>;

    async fn list(&self) -> Result<Vec<DeploymentRecord>, StoreError>;
}

/// The deployment store used by the dispatcher, workers, and sweeper.
#[derive(Clone)]
pub struct DeploymentStore {
    repo: Arc<dyn DeploymentRepository>,
    ttl: Duration,
}

impl DeploymentStore {
    pub fn new(repo: Arc<dyn DeploymentRepository>, ttl: Duration) -> Self {
        Self { repo, ttl }
    }

    pub async fn get(&self, pr_number: u64) -> Result<Option<DeploymentRecord>, StoreError> {
        self.repo.get(pr_number).await
    }

    pub async fn list(&self) -> Result<Vec<DeploymentRecord>, StoreError> {
        self.repo.list().await
    }

    /// Deletion is reserved for the destroy executor and the sweeper.
    pub async fn delete(&self, pr_number: u64) -> Result<bool, StoreError> {
        self.repo.delete(pr_number).await
    }

    /// CreateOrUpdate entry point: create a fresh `queued` record, or
    /// requeue an existing one whose status permits it. A record that is
    /// `building` or `destroying` rejects the upsert with a conflict.
    pub async fn upsert_queued(
        &self,
        pr_number: u64,
        meta: PrMetadata,
    ) -> Result<DeploymentRecord, StoreError> {
        for _ in 0..CAS_RETRIES {
            let current = self.repo.get(pr_number).await?;
            let observed = current.as_ref().map(|r| r.status);
            if !DeploymentStatus::can_transition(observed, DeploymentStatus::Queued) {
                return Err(StoreError::Conflict {
                    pr_number,
                    from: observed,
                    to: DeploymentStatus::Queued,
                });
            }

            let now = Utc::now();
            let record = match current {
                Some(mut existing) => {
                    existing.requeue(meta.clone(), now);
                    existing
                }
                None => DeploymentRecord::new_queued(pr_number, meta.clone(), now),
            };

            if self.repo.put_if_status(observed, &record, self.ttl).await? {
                return Ok(record);
            }
            // Lost the race; re-read and try again.
        }
        Err(StoreError::Conflict {
            pr_number,
            from: None,
            to: DeploymentStatus::Queued,
        })
    }

    /// Guarded status transition with an arbitrary record mutation.
    ///
    /// The mutation runs after the status is updated, inside the CAS loop,
    /// so it may be retried; it must be idempotent on the record it is
    /// given (field assignments are).
    pub async fn transition<F>(
        &self,
        pr_number: u64,
        to: DeploymentStatus,
        mutate: F,
    ) -> Result<DeploymentRecord, StoreError>
    where
        F: Fn(&mut DeploymentRecord),
    {
        for _ in 0..CAS_RETRIES {
            let Some(mut record) = self.repo.get(pr_number).await? else {
                return Err(StoreError::NotFound(pr_number));
            };
            let observed = record.status;
            if !DeploymentStatus::can_transition(Some(observed), to) {
                return Err(StoreError::Conflict {
                    pr_number,
                    from: Some(observed),
                    to,
                });
            }

            record.status = to;
            record.updated_at = Utc::now();
            mutate(&mut record);
            debug_assert!(record.running_invariant_holds());

            if self
                .repo
                .put_if_status(Some(observed), &record, self.ttl)
                .await?
            {
                return Ok(record);
            }
        }
        Err(StoreError::Conflict {
            pr_number,
            from: None,
            to,
        })
    }

    /// Record a classified executor failure on the record.
    pub async fn mark_failed(
        &self,
        pr_number: u64,
        error: &ExecError,
    ) -> Result<DeploymentRecord, StoreError> {
        let message = error.to_string();
        self.transition(pr_number, DeploymentStatus::Failed, move |rec| {
            rec.last_error = Some(message.clone());
        })
        .await
    }

    /// Per-status record counts, for the health snapshot and queue stats.
    pub async fn counts_by_status(
        &self,
    ) -> Result<HashMap<DeploymentStatus, usize>, StoreError> {
        let mut counts = HashMap::new();
        for record in self.repo.list().await? {
            *counts.entry(record.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    /// Host ports currently held by `running` records (invariant: pairwise
    /// distinct). The allocator excludes these.
    pub async fn ports_in_use(&self) -> Result<Vec<u16>, StoreError> {
        Ok(self
            .repo
            .list()
            .await?
            .iter()
            .filter(|r| r.status == DeploymentStatus::Running)
            .filter_map(|r| r.host_port)
            .collect())
    }
}
