//! Storage Network Protocol
//!
//! Internal endpoints and payloads the distributed storage cache uses to forward
//! mutations to a partition's primary, push record snapshots to backups and read
//! records held by other nodes. Payloads travel as JSON inside a
//! [`crate::cluster::peer::Reply`].

use super::record::{QueryRecord, StorageOp};
use super::types::QueryId;

use serde::{Deserialize, Serialize};

// --- API Endpoints ---

/// A non-owner forwards a mutation to the primary.
pub const ENDPOINT_EXECUTE: &str = "/internal/storage/execute";
/// The primary pushes a record snapshot to a backup.
pub const ENDPOINT_REPLICATE: &str = "/internal/storage/replicate";
/// Direct read of one locally held record (no routing).
pub const ENDPOINT_RECORD: &str = "/internal/storage/record";
/// Every record this node holds as primary.
pub const ENDPOINT_RECORDS: &str = "/internal/storage/records";
/// Drops everything this node holds.
pub const ENDPOINT_CLEAR: &str = "/internal/storage/clear";

// --- Data Transfer Objects ---

/// A mutation forwarded to the primary of `partition`.
///
/// `op_id` lets the primary answer a retried forward with the outcome it already
/// produced instead of applying the mutation twice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardOpRequest {
    pub partition: u32,
    pub op_id: String,
    pub op: StorageOp,
}

/// Snapshot of one query record sent from the primary to a backup.
///
/// `record: None` means the query was deleted. Backups keep the snapshot with the
/// highest `version`, so replicas delivered out of order cannot roll a record back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicateRequest {
    pub partition: u32,
    pub op_id: String,
    pub query_id: QueryId,
    pub version: u64,
    pub record: Option<QueryRecord>,
}
