//! Expiration Sweeps
//!
//! A query nobody has polled for `query_timeout_ms` is canceled and its queued work
//! revoked. Finished queries stay readable for `grace_ms` after their last activity
//! and are then deleted with all their tasks.

use crate::config::MonitorConfig;
use crate::error::{QueryStorageError, Result};
use crate::queue::backend::QueueBackend;
use crate::storage::cache::StorageCache;
use crate::storage::record::QueryRecord;
use crate::storage::types::QueryStatus;

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

/// What one sweep changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub canceled: usize,
    pub deleted: usize,
    pub released_claims: usize,
    pub failed_tasks: usize,
    /// Another sweep was in progress; nothing was done.
    pub skipped: bool,
}

impl SweepReport {
    fn is_empty(&self) -> bool {
        self.canceled == 0 && self.deleted == 0 && self.failed_tasks == 0
    }
}

pub struct QueryMonitor {
    storage: Arc<dyn StorageCache>,
    queue: Arc<dyn QueueBackend>,
    config: MonitorConfig,
    sweeping: Mutex<()>,
}

impl QueryMonitor {
    pub fn new(
        storage: Arc<dyn StorageCache>,
        queue: Arc<dyn QueueBackend>,
        config: MonitorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage,
            queue,
            config,
            sweeping: Mutex::new(()),
        })
    }

    /// Runs one sweep as of `now` (ms since the epoch). Returns a skipped report when
    /// another sweep holds the guard.
    pub async fn sweep(&self, now: u64) -> Result<SweepReport> {
        let Ok(_guard) = self.sweeping.try_lock() else {
            tracing::debug!("Sweep already in progress, skipping");
            return Ok(SweepReport {
                skipped: true,
                ..SweepReport::default()
            });
        };

        let mut report = SweepReport::default();
        for record in self.storage.load_owned().await? {
            let outcome = if record.state.status.is_terminal() {
                self.reap_finished(&record, now, &mut report).await
            } else {
                self.cancel_if_expired(&record, now, &mut report).await
            };
            match outcome {
                Ok(()) => {}
                // Deleted or changed by someone else since the snapshot.
                Err(QueryStorageError::NotFound(_)) | Err(QueryStorageError::InvalidTransition(_)) => {
                    tracing::debug!("Query {} changed during sweep", record.query_id());
                }
                Err(e) => return Err(e),
            }
        }

        if !report.is_empty() {
            tracing::info!(
                "Sweep: {} canceled, {} deleted, {} tasks failed, {} claims released",
                report.canceled,
                report.deleted,
                report.failed_tasks,
                report.released_claims
            );
        }
        Ok(report)
    }

    async fn cancel_if_expired(
        &self,
        record: &QueryRecord,
        now: u64,
        report: &mut SweepReport,
    ) -> Result<()> {
        let state = &record.state;
        if !state.is_expired(now, self.config.query_timeout_ms) {
            return Ok(());
        }
        let query_id = &state.query_id;

        self.storage
            .update_query_status(
                query_id,
                QueryStatus::Canceled,
                Some(format!(
                    "expired: not polled for {} ms",
                    now.saturating_sub(state.last_checked_at)
                )),
            )
            .await?;
        // The grace period before deletion starts now.
        self.storage.touch_query(query_id, now).await?;
        report.failed_tasks += self.storage.fail_pending_tasks(query_id, None).await?;
        report.released_claims += self.queue.revoke_query(query_id).await?;
        report.canceled += 1;

        tracing::info!("Canceled expired query {}", query_id);
        Ok(())
    }

    async fn reap_finished(
        &self,
        record: &QueryRecord,
        now: u64,
        report: &mut SweepReport,
    ) -> Result<()> {
        let state = &record.state;
        let query_id = &state.query_id;

        if !record.all_tasks_terminal() {
            // Work left behind by a worker that never came back. Every task change
            // refreshes the query, so an idle query has no recently touched task.
            if state.is_expired(now, self.config.query_timeout_ms) {
                report.failed_tasks += self.storage.fail_pending_tasks(query_id, Some(0)).await?;
                report.released_claims += self.queue.revoke_query(query_id).await?;
            }
            return Ok(());
        }

        if state.is_expired(now, self.config.grace_ms) {
            let tasks = self.storage.delete_query(query_id).await?;
            report.released_claims += self.queue.revoke_query(query_id).await?;
            report.deleted += 1;
            tracing::info!(
                "Deleted {:?} query {} ({} tasks)",
                state.status,
                query_id,
                tasks
            );
        }
        Ok(())
    }

    /// Sweeps every `sweep_interval_ms` until `shutdown` turns true.
    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let period = Duration::from_millis(self.config.sweep_interval_ms.max(1));
        tracing::info!("Starting monitor (sweep every {:?})", period);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = self.sweep(crate::storage::types::now_ms()).await {
                            tracing::warn!("Sweep failed: {}", e);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("Monitor stopped");
        })
    }
}
