//! Distributed Queue
//!
//! Tasks are partitioned by query id, so every task of a query lands in the same
//! partition and the per-query ordering rule is enforced by one node: the partition's
//! primary. Executors claim only from partitions their node is primary for. Published
//! and acknowledged entries are mirrored to backups; leases are not, so after a
//! failover the new primary hands out again whatever was in flight.

use super::backend::{QueueBackend, QueueStats};
use super::pool::TaskPool;
use super::protocol::*;
use super::types::{Claim, QueuedTask};
use crate::cluster::partitioner::PartitionManager;
use crate::cluster::peer::PeerClient;
use crate::error::{QueryStorageError, Result};
use crate::storage::types::{QueryId, now_ms};

use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct DistributedQueue {
    /// Partition -> queue of that partition (primary or backup copy).
    pools: DashMap<u32, TaskPool>,
    published: Notify,
    partitioner: Arc<PartitionManager>,
    peers: Arc<PeerClient>,
    lease_ms: u64,
    owner: String,
}

impl DistributedQueue {
    pub fn new(partitioner: Arc<PartitionManager>, peers: Arc<PeerClient>, lease_ms: u64) -> Self {
        let owner = partitioner.local_node_id().to_string();
        Self {
            pools: DashMap::new(),
            published: Notify::new(),
            partitioner,
            peers,
            lease_ms,
            owner,
        }
    }

    fn partition_of(&self, query_id: &QueryId) -> u32 {
        self.partitioner.get_partition(query_id)
    }

    pub async fn publish_as_primary(&self, partition: u32, task: QueuedTask) -> Result<()> {
        let pooled = self.pools.entry(partition).or_default().publish(task)?;
        tracing::debug!(
            "Queued {:?} task {} in partition {}",
            pooled.task.kind,
            pooled.task.key,
            partition
        );
        self.published.notify_waiters();

        self.replicate(partition, QueueReplica::Insert(pooled)).await;
        Ok(())
    }

    pub async fn revoke_as_primary(&self, partition: u32, query_id: &QueryId) -> usize {
        let released = self
            .pools
            .get_mut(&partition)
            .map(|mut pool| pool.revoke_query(query_id, now_ms()))
            .unwrap_or(0);
        self.replicate(partition, QueueReplica::Purge(query_id.clone()))
            .await;
        released
    }

    pub fn apply_replica(&self, request: ReplicateQueueRequest) {
        let mut pool = self.pools.entry(request.partition).or_default();
        match request.change {
            QueueReplica::Insert(pooled) => pool.restore(pooled),
            QueueReplica::Remove(key) => {
                pool.remove(&key);
            }
            QueueReplica::Purge(query_id) => {
                pool.revoke_query(&query_id, now_ms());
            }
        }
    }

    async fn replicate(&self, partition: u32, change: QueueReplica) {
        let owners = self.partitioner.get_owners(partition);
        if owners.len() < 2 {
            return;
        }
        let request = ReplicateQueueRequest { partition, change };
        for backup in owners.iter().skip(1) {
            if backup == self.partitioner.local_node_id() {
                continue;
            }
            if let Err(e) = self
                .peers
                .post::<_, ()>(backup, ENDPOINT_QUEUE_REPLICATE, &request)
                .await
            {
                tracing::warn!("Failed to replicate queue change to {}: {}", backup, e);
            }
        }
    }

    /// One pass over the partitions this node is primary for, starting at a random one
    /// so no partition is always served first.
    fn try_claim(&self) -> Option<Claim> {
        let partitions = self.partitioner.my_primary_partitions();
        if partitions.is_empty() {
            return None;
        }
        let start = rand::thread_rng().gen_range(0..partitions.len());
        let now = now_ms();

        (0..partitions.len())
            .map(|offset| partitions[(start + offset) % partitions.len()])
            .find_map(|partition| {
                self.pools
                    .get_mut(&partition)
                    .and_then(|mut pool| pool.claim(&self.owner, self.lease_ms, now))
            })
    }

    fn with_claimed_pool<T>(
        &self,
        claim: &Claim,
        op: impl FnOnce(&mut TaskPool) -> Result<T>,
    ) -> Result<T> {
        let partition = self.partition_of(claim.task.query_id());
        let mut pool = self
            .pools
            .get_mut(&partition)
            .ok_or_else(|| QueryStorageError::ClaimExpired(claim.task.key.to_string()))?;
        op(&mut pool)
    }

    pub fn local_depth(&self) -> usize {
        self.pools.iter().map(|pool| pool.depth()).sum()
    }
}

#[async_trait]
impl QueueBackend for DistributedQueue {
    async fn publish(&self, task: QueuedTask) -> Result<()> {
        let partition = self.partition_of(task.query_id());
        let primary = self.partitioner.primary_of(partition).ok_or_else(|| {
            QueryStorageError::BackendUnavailable("no alive nodes own queue partitions".to_string())
        })?;

        if &primary == self.partitioner.local_node_id() {
            return self.publish_as_primary(partition, task).await;
        }

        tracing::debug!("Forwarding task {} to primary {}", task.key, primary);
        self.peers
            .post(&primary, ENDPOINT_QUEUE_PUBLISH, &PublishRequest { partition, task })
            .await
    }

    async fn claim(&self, timeout: Duration) -> Result<Option<Claim>> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let woken = self.published.notified();
            if let Some(claim) = self.try_claim() {
                tracing::debug!("Claimed task {}", claim.task.key);
                return Ok(Some(claim));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wait = (deadline - now).min(POLL_INTERVAL);
            let _ = tokio::time::timeout(wait, woken).await;
        }
    }

    async fn acknowledge(&self, claim: &Claim) -> Result<()> {
        self.with_claimed_pool(claim, |pool| pool.acknowledge(claim, now_ms()))?;
        tracing::debug!("Acknowledged task {}", claim.task.key);
        self.published.notify_waiters();

        let partition = self.partition_of(claim.task.query_id());
        self.replicate(partition, QueueReplica::Remove(claim.task.key.clone()))
            .await;
        Ok(())
    }

    async fn release(&self, claim: &Claim) -> Result<()> {
        self.with_claimed_pool(claim, |pool| pool.release(claim, now_ms()))?;
        tracing::debug!("Released task {}", claim.task.key);
        self.published.notify_waiters();
        Ok(())
    }

    async fn renew(&self, claim: &Claim) -> Result<u64> {
        self.with_claimed_pool(claim, |pool| pool.renew(claim, self.lease_ms, now_ms()))
    }

    async fn revoke_query(&self, query_id: &QueryId) -> Result<usize> {
        let partition = self.partition_of(query_id);
        let primary = self.partitioner.primary_of(partition).ok_or_else(|| {
            QueryStorageError::BackendUnavailable("no alive nodes own queue partitions".to_string())
        })?;

        if &primary == self.partitioner.local_node_id() {
            let released = self.revoke_as_primary(partition, query_id).await;
            tracing::debug!("Revoked query {} ({} active claims)", query_id, released);
            return Ok(released);
        }

        self.peers
            .post(
                &primary,
                ENDPOINT_QUEUE_REVOKE,
                &RevokeRequest {
                    partition,
                    query_id: query_id.clone(),
                },
            )
            .await
    }

    /// Counts for the partitions this node is primary for.
    async fn stats(&self) -> Result<QueueStats> {
        let now = now_ms();
        let mut stats = QueueStats::default();
        for partition in self.partitioner.my_primary_partitions() {
            if let Some(pool) = self.pools.get(&partition) {
                stats.queued += pool.depth();
                stats.claimed += pool.claimed(now);
            }
        }
        Ok(stats)
    }
}
