//! Distributed Storage Cache
//!
//! Query records are partitioned by query id. The primary of a partition applies every
//! mutation of its queries under the partition map's entry lock, which is what makes
//! each operation atomic, then pushes the resulting record snapshot to the backups.
//! Any other node forwards the mutation to the primary and returns its outcome.

use super::cache::StorageCache;
use super::protocol::*;
use super::record::{OpOutcome, QueryRecord, StorageOp};
use super::types::*;
use crate::cluster::partitioner::PartitionManager;
use crate::cluster::peer::PeerClient;
use crate::cluster::types::NodeId;
use crate::error::{QueryStorageError, Result};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use dashmap::mapref::one::Ref;
use std::sync::Arc;
use uuid::Uuid;

const MAX_TRACKED_OPS: usize = 10_000;

#[derive(Debug, Clone)]
struct StoredRecord {
    record: QueryRecord,
    version: u64,
}

pub struct DistributedStorageCache {
    local_data: DashMap<u32, DashMap<QueryId, StoredRecord>>,
    /// Outcomes of forwarded ops already applied here, keyed by op id.
    processed_ops: DashMap<String, OpOutcome>,
    /// Version at which a query was deleted, so late replicas cannot resurrect it.
    tombstones: DashMap<QueryId, u64>,
    partitioner: Arc<PartitionManager>,
    peers: Arc<PeerClient>,
}

impl DistributedStorageCache {
    pub fn new(partitioner: Arc<PartitionManager>, peers: Arc<PeerClient>) -> Self {
        Self {
            local_data: DashMap::new(),
            processed_ops: DashMap::new(),
            tombstones: DashMap::new(),
            partitioner,
            peers,
        }
    }

    pub fn partition_of(&self, query_id: &QueryId) -> u32 {
        self.partitioner.get_partition(query_id)
    }

    fn local_id(&self) -> &NodeId {
        self.partitioner.local_node_id()
    }

    fn partition_map(&self, partition: u32) -> Ref<'_, u32, DashMap<QueryId, StoredRecord>> {
        self.local_data.entry(partition).or_default().downgrade()
    }

    fn owners_of(&self, query_id: &QueryId) -> Result<(u32, Vec<NodeId>)> {
        let partition = self.partitioner.get_partition(query_id);
        let owners = self.partitioner.get_owners(partition);
        if owners.is_empty() {
            return Err(QueryStorageError::BackendUnavailable(
                "no alive nodes own storage partitions".to_string(),
            ));
        }
        Ok((partition, owners))
    }

    /// Applies `op` as the partition's primary and replicates the result.
    ///
    /// A repeated `op_id` returns the outcome recorded the first time.
    pub async fn execute_as_primary(
        &self,
        partition: u32,
        op_id: String,
        op: StorageOp,
    ) -> Result<OpOutcome> {
        if let Some(outcome) = self.processed_ops.get(&op_id) {
            tracing::debug!("Op {} already applied, returning recorded outcome", op_id);
            return Ok(outcome.clone());
        }

        let query_id = op.query_id().clone();
        let (outcome, version, snapshot) = self.apply_local(partition, op)?;

        if self.processed_ops.len() > MAX_TRACKED_OPS {
            self.processed_ops.clear();
        }
        self.processed_ops.insert(op_id.clone(), outcome.clone());

        let request = ReplicateRequest {
            partition,
            op_id,
            query_id,
            version,
            record: snapshot,
        };
        self.replicate_to_backups(&request).await;

        Ok(outcome)
    }

    fn apply_local(
        &self,
        partition: u32,
        op: StorageOp,
    ) -> Result<(OpOutcome, u64, Option<QueryRecord>)> {
        let now = now_ms();
        let partition_map = self.partition_map(partition);

        match op {
            StorageOp::Create(new) => match partition_map.entry(new.query_id.clone()) {
                Entry::Occupied(_) => Err(QueryStorageError::InvalidTransition(format!(
                    "query {} already exists",
                    new.query_id
                ))),
                Entry::Vacant(slot) => {
                    tracing::debug!(
                        "Creating query {} in partition {}",
                        new.query_id,
                        partition
                    );
                    let version = self
                        .tombstones
                        .remove(&new.query_id)
                        .map(|(_, v)| v + 1)
                        .unwrap_or(1);
                    let record = QueryRecord::new(new, now);
                    let state = record.state.clone();
                    slot.insert(StoredRecord {
                        record: record.clone(),
                        version,
                    });
                    Ok((OpOutcome::State(state), version, Some(record)))
                }
            },
            StorageOp::Delete { query_id } => {
                let (removed, version) = match partition_map.remove(&query_id) {
                    Some((_, stored)) => (stored.record.tasks.len(), stored.version + 1),
                    None => (0, 1),
                };
                self.tombstones.insert(query_id.clone(), version);
                tracing::debug!("Deleted query {} ({} tasks)", query_id, removed);
                Ok((OpOutcome::Count(removed), version, None))
            }
            other => {
                let query_id = other.query_id().clone();
                let mut stored = partition_map
                    .get_mut(&query_id)
                    .ok_or_else(|| QueryStorageError::NotFound(format!("query {}", query_id)))?;
                let outcome = stored.record.apply(other, now)?;
                stored.version += 1;
                Ok((outcome, stored.version, Some(stored.record.clone())))
            }
        }
    }

    async fn replicate_to_backups(&self, request: &ReplicateRequest) {
        let owners = self.partitioner.get_owners(request.partition);
        for backup in owners.iter().skip(1) {
            if backup == self.local_id() {
                continue;
            }
            if let Err(e) = self
                .peers
                .post::<_, bool>(backup, ENDPOINT_REPLICATE, request)
                .await
            {
                // The next mutation ships the whole record again, so a missed
                // snapshot heals on its own.
                tracing::warn!(
                    "Failed to replicate query {} to {}: {}",
                    request.query_id,
                    backup,
                    e
                );
            }
        }
    }

    /// Stores a snapshot pushed by a primary. Returns false if it was stale.
    pub fn store_replica(&self, request: ReplicateRequest) -> bool {
        let ReplicateRequest {
            partition,
            query_id,
            version,
            record,
            ..
        } = request;

        if self
            .tombstones
            .get(&query_id)
            .is_some_and(|deleted| *deleted >= version)
        {
            return false;
        }

        let partition_map = self.partition_map(partition);
        let current = partition_map.get(&query_id).map(|s| s.version).unwrap_or(0);
        if version <= current {
            return false;
        }

        match record {
            Some(record) => {
                partition_map.insert(query_id, StoredRecord { record, version });
            }
            None => {
                partition_map.remove(&query_id);
                if self.tombstones.len() > MAX_TRACKED_OPS {
                    self.tombstones.clear();
                }
                self.tombstones.insert(query_id, version);
            }
        }
        true
    }

    pub fn get_local(&self, query_id: &QueryId) -> Option<QueryRecord> {
        let partition = self.partitioner.get_partition(query_id);
        self.local_data
            .get(&partition)
            .and_then(|map| map.get(query_id).map(|stored| stored.record.clone()))
    }

    /// Records of the partitions this node is currently primary for.
    pub fn primary_records(&self) -> Vec<QueryRecord> {
        self.local_data
            .iter()
            .filter(|entry| self.partitioner.is_local_primary(*entry.key()))
            .flat_map(|entry| {
                entry
                    .value()
                    .iter()
                    .map(|stored| stored.record.clone())
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Drops every record held here, primary or backup. Returns how many were primaries.
    pub fn clear_local(&self) -> usize {
        let cleared = self.primary_records().len();
        self.local_data.clear();
        self.processed_ops.clear();
        self.tombstones.clear();
        cleared
    }

    pub fn local_entry_count(&self) -> usize {
        self.local_data.iter().map(|entry| entry.value().len()).sum()
    }
}

#[async_trait]
impl StorageCache for DistributedStorageCache {
    async fn execute(&self, op: StorageOp) -> Result<OpOutcome> {
        let (partition, owners) = self.owners_of(op.query_id())?;
        let op_id = Uuid::new_v4().to_string();
        let primary = &owners[0];

        if primary == self.local_id() {
            return self.execute_as_primary(partition, op_id, op).await;
        }

        tracing::debug!("Forwarding op on {} to primary {}", op.query_id(), primary);
        let request = ForwardOpRequest {
            partition,
            op_id,
            op,
        };
        self.peers.post(primary, ENDPOINT_EXECUTE, &request).await
    }

    async fn load(&self, query_id: &QueryId) -> Result<Option<QueryRecord>> {
        let (_, owners) = self.owners_of(query_id)?;

        if owners.contains(self.local_id()) {
            return Ok(self.get_local(query_id));
        }

        let path = format!("{}/{}", ENDPOINT_RECORD, query_id);
        let mut last_error = None;
        for owner in &owners {
            match self.peers.get::<Option<QueryRecord>>(owner, &path).await {
                Ok(record) => return Ok(record),
                Err(e) => {
                    tracing::warn!("Failed to read query {} from {}: {}", query_id, owner, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            QueryStorageError::BackendUnavailable(format!("no owner reachable for {}", query_id))
        }))
    }

    async fn load_all(&self) -> Result<Vec<QueryRecord>> {
        let mut records = self.primary_records();
        for peer in self.peers.membership().peers() {
            match self
                .peers
                .get::<Vec<QueryRecord>>(&peer.id, ENDPOINT_RECORDS)
                .await
            {
                Ok(remote) => records.extend(remote),
                Err(e) => {
                    tracing::warn!("Skipping records of {} in listing: {}", peer.id, e);
                }
            }
        }
        Ok(records)
    }

    async fn load_owned(&self) -> Result<Vec<QueryRecord>> {
        Ok(self.primary_records())
    }

    async fn clear(&self) -> Result<usize> {
        let mut cleared = self.clear_local();
        for peer in self.peers.membership().peers() {
            cleared += self
                .peers
                .post::<_, usize>(&peer.id, ENDPOINT_CLEAR, &())
                .await?;
        }
        tracing::info!("Cleared {} queries from distributed storage", cleared);
        Ok(cleared)
    }
}
