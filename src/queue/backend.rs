use super::types::{Claim, QueuedTask};
use crate::error::Result;
use crate::storage::types::QueryId;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueStats {
    /// Entries published and not yet acknowledged, claimed ones included.
    pub queued: usize,
    /// Entries currently under an active lease.
    pub claimed: usize,
}

/// Hands tasks to executors with at-most-one active claim per task.
///
/// A claim that is neither acknowledged nor released within the lease is given out
/// again; `renew` pushes the lease back for long-running work.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    async fn publish(&self, task: QueuedTask) -> Result<()>;

    /// Waits up to `timeout` for a claimable task.
    async fn claim(&self, timeout: Duration) -> Result<Option<Claim>>;

    /// Removes the claimed task. Fails with `ClaimExpired` if the lease lapsed.
    async fn acknowledge(&self, claim: &Claim) -> Result<()>;

    /// Makes the claimed task available again. Fails with `ClaimExpired` if the lease lapsed.
    async fn release(&self, claim: &Claim) -> Result<()>;

    /// Extends the lease; returns the new expiry in epoch millis.
    async fn renew(&self, claim: &Claim) -> Result<u64>;

    /// Withdraws every queued entry of a query and invalidates its outstanding claims.
    /// Returns the number of claims that were still active.
    async fn revoke_query(&self, query_id: &QueryId) -> Result<usize>;

    async fn stats(&self) -> Result<QueueStats>;
}
