//! Queue Network Protocol
//!
//! Endpoints and payloads between nodes of the distributed queue. Claims never cross
//! the wire: executors only claim from partitions their own node is primary for.

use super::pool::PooledTask;
use super::types::QueuedTask;
use crate::storage::types::{QueryId, TaskKey};

use serde::{Deserialize, Serialize};

// --- API Endpoints ---

/// A non-owner forwards a publish to the partition primary.
pub const ENDPOINT_QUEUE_PUBLISH: &str = "/internal/queue/publish";
/// Revocation forwarded to the partition primary.
pub const ENDPOINT_QUEUE_REVOKE: &str = "/internal/queue/revoke";
/// Primary -> backup replication of queue changes.
pub const ENDPOINT_QUEUE_REPLICATE: &str = "/internal/queue/replicate";

// --- Data Transfer Objects ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishRequest {
    pub partition: u32,
    pub task: QueuedTask,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevokeRequest {
    pub partition: u32,
    pub query_id: QueryId,
}

/// One change to a partition's queue, mirrored on its backups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum QueueReplica {
    Insert(PooledTask),
    Remove(TaskKey),
    Purge(QueryId),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicateQueueRequest {
    pub partition: u32,
    pub change: QueueReplica,
}
