//! Redis-backed implementation of `DeploymentRepository`.
//!
//! One JSON value per record under `envzilla:deployments:<pr>`, expiring
//! after the store TTL (refreshed on every write, per the record
//! lifecycle). The status guard runs server-side as a Lua script so the
//! compare-and-set holds across controller replicas.

use async_trait::async_trait;
use envzilla_core::{DeploymentRecord, DeploymentStatus};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;

use super::{DeploymentRepository, StoreError};

const KEY_PREFIX: &str = "envzilla:deployments:";

/// Stores ARGV[2] under KEYS[1] with EX ARGV[3], but only when the stored
/// record's status equals ARGV[1] (empty string = key must not exist).
const PUT_IF_STATUS: &str = r#"
local cur = redis.call('GET', KEYS[1])
if cur then
  if ARGV[1] == '' then return 0 end
  local status = cjson.decode(cur)['status']
  if status ~= ARGV[1] then return 0 end
else
  if ARGV[1] ~= '' then return 0 end
end
redis.call('SET', KEYS[1], ARGV[2], 'EX', tonumber(ARGV[3]))
return 1
"#;

pub struct RedisDeploymentRepository {
    conn: ConnectionManager,
    put_if_status: redis::Script,
}

impl RedisDeploymentRepository {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            put_if_status: redis::Script::new(PUT_IF_STATUS),
        }
    }

    fn key(pr_number: u64) -> String {
        format!("{KEY_PREFIX}{pr_number}")
    }

    fn storage<E: std::fmt::Display>(err: E) -> StoreError {
        StoreError::Storage(err.to_string())
    }
}

#[async_trait]
impl DeploymentRepository for RedisDeploymentRepository {
    async fn get(&self, pr_number: u64) -> Result<Option<DeploymentRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(Self::key(pr_number))
            .await
            .map_err(Self::storage)?;
        match raw {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| StoreError::Storage(format!("corrupt record for pr {pr_number}: {e}"))),
            None => Ok(None),
        }
    }

    async fn put_if_status(
        &self,
        expected: Option<DeploymentStatus>,
        record: &DeploymentRecord,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(record).map_err(Self::storage)?;
        let expected_arg = expected.map(|s| s.as_str()).unwrap_or("");
        let stored: i64 = self
            .put_if_status
            .key(Self::key(record.pr_number))
            .arg(expected_arg)
            .arg(json)
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await
            .map_err(Self::storage)?;
        Ok(stored == 1)
    }

    async fn delete(&self, pr_number: u64) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn
            .del(Self::key(pr_number))
            .await
            .map_err(Self::storage)?;
        Ok(removed > 0)
    }

    async fn list(&self) -> Result<Vec<DeploymentRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let mut keys: Vec<String> = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(format!("{KEY_PREFIX}*"))
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(Self::storage)?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            // Keys can expire between SCAN and GET; skip holes.
            let raw: Option<String> = conn.get(&key).await.map_err(Self::storage)?;
            if let Some(json) = raw {
                match serde_json::from_str::<DeploymentRecord>(&json) {
                    Ok(record) => records.push(record),
                    Err(e) => {
                        tracing::warn!("skipping corrupt deployment record at {key}: {e}");
                    }
                }
            }
        }
        Ok(records)
    }
}
