//! In-memory implementation of `DeploymentRepository`.
//!
//! The legacy single-process variant: records live in a map behind a
//! mutex and are lost on restart. Tests run against this; production
//! uses the Redis repository.

use async_trait::async_trait;
use envzilla_core::{DeploymentRecord, DeploymentStatus};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::{DeploymentRepository, StoreError};

pub struct InMemoryDeploymentRepository {
    records: Mutex<HashMap<u64, (DeploymentRecord, Instant)>>,
}

impl InMemoryDeploymentRepository {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryDeploymentRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeploymentRepository for InMemoryDeploymentRepository {
    async fn get(&self, pr_number: u64) -> Result<Option<DeploymentRecord>, StoreError> {
        let mut records = self.records.lock().expect("deployment map poisoned");
        match records.get(&pr_number) {
            Some((_, expiry)) if *expiry <= Instant::now() => {
                records.remove(&pr_number);
                Ok(None)
            }
            Some((record, _)) => Ok(Some(record.clone())),
            None => Ok(None),
        }
    }

    async fn put_if_status(
        &self,
        expected: Option<DeploymentStatus>,
        record: &DeploymentRecord,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut records = self.records.lock().expect("deployment map poisoned");
        let now = Instant::now();
        let observed = records
            .get(&record.pr_number)
            .filter(|(_, expiry)| *expiry > now)
            .map(|(rec, _)| rec.status);
        if observed != expected {
            return Ok(false);
        }
        records.insert(record.pr_number, (record.clone(), now + ttl));
        Ok(true)
    }

    async fn delete(&self, pr_number: u64) -> Result<bool, StoreError> {
        let mut records = self.records.lock().expect("deployment map poisoned");
        Ok(records.remove(&pr_number).is_some())
    }

    async fn list(&self) -> Result<Vec<DeploymentRecord>, StoreError> {
        let mut records = self.records.lock().expect("deployment map poisoned");
        let now = Instant::now();
        records.retain(|_, (_, expiry)| *expiry > now);
        Ok(records.values().map(|(rec, _)| rec.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use envzilla_core::PrMetadata;

    fn record(pr: u64) -> DeploymentRecord {
        DeploymentRecord::new_queued(pr, PrMetadata::default(), Utc::now())
    }

    const TTL: Duration = Duration::from_secs(3600);

    #[tokio::test]
    async fn guard_rejects_wrong_expected_status() {
        let repo = InMemoryDeploymentRepository::new();
        let rec = record(1);

        // Create guarded on "no record".
        assert!(repo.put_if_status(None, &rec, TTL).await.unwrap());
        // A second create must fail: a record now exists.
        assert!(!repo.put_if_status(None, &rec, TTL).await.unwrap());
        // Update guarded on the correct observed status succeeds.
        let mut building = rec.clone();
        building.status = DeploymentStatus::Building;
        assert!(repo
            .put_if_status(Some(DeploymentStatus::Queued), &building, TTL)
            .await
            .unwrap());
        // Stale guard (still expects queued) fails.
        assert!(!repo
            .put_if_status(Some(DeploymentStatus::Queued), &building, TTL)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn expired_records_read_as_absent() {
        let repo = InMemoryDeploymentRepository::new();
        let rec = record(1);
        assert!(repo
            .put_if_status(None, &rec, Duration::from_millis(10))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(repo.get(1).await.unwrap().is_none());
        assert!(repo.list().await.unwrap().is_empty());
        // And the slot is reusable.
        assert!(repo.put_if_status(None, &rec, TTL).await.unwrap());
    }

    #[tokio::test]
    async fn delete_reports_presence() {
        let repo = InMemoryDeploymentRepository::new();
        assert!(!repo.delete(1).await.unwrap());
        repo.put_if_status(None, &record(1), TTL).await.unwrap();
        assert!(repo.delete(1).await.unwrap());
        assert!(repo.get(1).await.unwrap().is_none());
    }
}
