//! In-process queue backend.

use super::backend::{QueueBackend, QueueStats};
use super::pool::TaskPool;
use super::types::{Claim, QueuedTask};
use crate::error::Result;
use crate::storage::types::{QueryId, now_ms};

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct LocalQueue {
    pool: Mutex<TaskPool>,
    published: Notify,
    lease_ms: u64,
    owner: String,
}

impl LocalQueue {
    pub fn new(lease_ms: u64) -> Self {
        Self {
            pool: Mutex::new(TaskPool::new()),
            published: Notify::new(),
            lease_ms,
            owner: format!("local-{}", uuid::Uuid::new_v4()),
        }
    }
}

#[async_trait]
impl QueueBackend for LocalQueue {
    async fn publish(&self, task: QueuedTask) -> Result<()> {
        let pooled = self.pool.lock().await.publish(task)?;
        tracing::debug!("Published {:?} task {} at {}", pooled.task.kind, pooled.task.key, pooled.seq);
        self.published.notify_waiters();
        Ok(())
    }

    async fn claim(&self, timeout: Duration) -> Result<Option<Claim>> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let woken = self.published.notified();
            if let Some(claim) = self
                .pool
                .lock()
                .await
                .claim(&self.owner, self.lease_ms, now_ms())
            {
                tracing::debug!("Claimed task {}", claim.task.key);
                return Ok(Some(claim));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            // Leases lapse without any notification, so poll as well.
            let wait = (deadline - now).min(POLL_INTERVAL);
            let _ = tokio::time::timeout(wait, woken).await;
        }
    }

    async fn acknowledge(&self, claim: &Claim) -> Result<()> {
        self.pool.lock().await.acknowledge(claim, now_ms())?;
        tracing::debug!("Acknowledged task {}", claim.task.key);
        self.published.notify_waiters();
        Ok(())
    }

    async fn release(&self, claim: &Claim) -> Result<()> {
        self.pool.lock().await.release(claim, now_ms())?;
        tracing::debug!("Released task {}", claim.task.key);
        self.published.notify_waiters();
        Ok(())
    }

    async fn renew(&self, claim: &Claim) -> Result<u64> {
        let expires_at = self
            .pool
            .lock()
            .await
            .renew(claim, self.lease_ms, now_ms())?;
        tracing::trace!("Renewed lease for task {}", claim.task.key);
        Ok(expires_at)
    }

    async fn revoke_query(&self, query_id: &QueryId) -> Result<usize> {
        let released = self.pool.lock().await.revoke_query(query_id, now_ms());
        tracing::debug!("Revoked query {} ({} active claims)", query_id, released);
        Ok(released)
    }

    async fn stats(&self) -> Result<QueueStats> {
        let pool = self.pool.lock().await;
        Ok(QueueStats {
            queued: pool.depth(),
            claimed: pool.claimed(now_ms()),
        })
    }
}
