//! Synchronous In-Process Storage
//!
//! One lock guards every record, so each operation is trivially atomic and
//! listings are point-in-time snapshots. Meant for single-node deployments and tests.

use super::cache::StorageCache;
use super::record::{OpOutcome, QueryRecord, StorageOp};
use super::types::*;
use crate::error::{QueryStorageError, Result};

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct SyncStorageCache {
    records: RwLock<HashMap<QueryId, QueryRecord>>,
}

impl SyncStorageCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn query_count(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl StorageCache for SyncStorageCache {
    async fn execute(&self, op: StorageOp) -> Result<OpOutcome> {
        let now = now_ms();
        let mut records = self.records.write().await;

        match op {
            StorageOp::Create(new) => {
                if records.contains_key(&new.query_id) {
                    return Err(QueryStorageError::InvalidTransition(format!(
                        "query {} already exists",
                        new.query_id
                    )));
                }
                tracing::debug!("Creating query {} ({})", new.query_id, new.query_logic);
                let record = QueryRecord::new(new, now);
                let state = record.state.clone();
                records.insert(state.query_id.clone(), record);
                Ok(OpOutcome::State(state))
            }
            StorageOp::Delete { query_id } => {
                let removed = records.remove(&query_id).map(|r| r.tasks.len()).unwrap_or(0);
                tracing::debug!("Deleted query {} ({} tasks)", query_id, removed);
                Ok(OpOutcome::Count(removed))
            }
            other => {
                let query_id = other.query_id().clone();
                let record = records
                    .get_mut(&query_id)
                    .ok_or_else(|| QueryStorageError::NotFound(format!("query {}", query_id)))?;
                record.apply(other, now)
            }
        }
    }

    async fn load(&self, query_id: &QueryId) -> Result<Option<QueryRecord>> {
        Ok(self.records.read().await.get(query_id).cloned())
    }

    async fn load_all(&self) -> Result<Vec<QueryRecord>> {
        Ok(self.records.read().await.values().cloned().collect())
    }

    async fn clear(&self) -> Result<usize> {
        let mut records = self.records.write().await;
        let cleared = records.len();
        records.clear();
        tracing::info!("Cleared {} queries from synchronous storage", cleared);
        Ok(cleared)
    }
}
