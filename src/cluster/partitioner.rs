use super::membership::MembershipService;
use super::types::NodeId;
use crate::storage::types::QueryId;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Maps query ids to partitions and partitions to owning nodes.
///
/// Owners are the alive members sorted by id, starting at `partition % members`: the
/// first is the primary, the rest are backups. A partition never lists the same node
/// twice, so a single-node cluster owns everything as primary with no backups.
pub struct PartitionManager {
    num_partitions: u32,
    replication_factor: usize,
    membership: Arc<MembershipService>,
}

impl PartitionManager {
    pub fn new(
        membership: Arc<MembershipService>,
        num_partitions: u32,
        replication_factor: usize,
    ) -> Self {
        Self {
            num_partitions: num_partitions.max(1),
            replication_factor: replication_factor.max(1),
            membership,
        }
    }

    pub fn num_partitions(&self) -> u32 {
        self.num_partitions
    }

    pub fn get_partition(&self, query_id: &QueryId) -> u32 {
        let mut hasher = DefaultHasher::new();
        query_id.0.hash(&mut hasher);
        (hasher.finish() % self.num_partitions as u64) as u32
    }

    pub fn get_owners(&self, partition: u32) -> Vec<NodeId> {
        let mut node_ids: Vec<NodeId> = self
            .membership
            .get_alive_members()
            .into_iter()
            .map(|node| node.id)
            .collect();
        if node_ids.is_empty() {
            return vec![];
        }
        node_ids.sort();

        let count = self.replication_factor.min(node_ids.len());
        let start = partition as usize % node_ids.len();
        (0..count)
            .map(|offset| node_ids[(start + offset) % node_ids.len()].clone())
            .collect()
    }

    pub fn primary_of(&self, partition: u32) -> Option<NodeId> {
        self.get_owners(partition).into_iter().next()
    }

    pub fn local_node_id(&self) -> &NodeId {
        self.membership.local_id()
    }

    pub fn is_local_primary(&self, partition: u32) -> bool {
        self.primary_of(partition).as_ref() == Some(self.local_node_id())
    }

    pub fn my_primary_partitions(&self) -> Vec<u32> {
        (0..self.num_partitions)
            .filter(|&partition| self.is_local_primary(partition))
            .collect()
    }

    pub fn my_backup_partitions(&self) -> Vec<u32> {
        let my_id = self.local_node_id();
        (0..self.num_partitions)
            .filter(|&partition| self.get_owners(partition).iter().skip(1).any(|id| id == my_id))
            .collect()
    }
}
