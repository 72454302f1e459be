//! Monitor Module Tests
//!
//! ## Test Scopes
//! - **Expiry**: unpolled queries are canceled, their tasks failed and claims revoked.
//! - **Reaping**: finished queries are deleted after the grace period, stale work first.
//! - **Sweeps**: idempotence, no overlap, background loop and shutdown.

#[cfg(test)]
mod tests {
    use crate::config::MonitorConfig;
    use crate::error::{QueryStorageError, Result};
    use crate::monitor::monitor::{QueryMonitor, SweepReport};
    use crate::queue::backend::QueueBackend;
    use crate::queue::local::LocalQueue;
    use crate::storage::cache::StorageCache;
    use crate::storage::memory::SyncStorageCache;
    use crate::storage::record::{OpOutcome, QueryRecord, StorageOp};
    use crate::storage::types::*;
    use crate::testing::{new_query, submit};

    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::watch;

    const TIMEOUT_MS: u64 = 1_000;
    const GRACE_MS: u64 = 500;

    fn monitor_config() -> MonitorConfig {
        MonitorConfig {
            sweep_interval_ms: 10,
            query_timeout_ms: TIMEOUT_MS,
            grace_ms: GRACE_MS,
        }
    }

    fn backends() -> (Arc<dyn StorageCache>, Arc<dyn QueueBackend>) {
        (
            Arc::new(SyncStorageCache::new()),
            Arc::new(LocalQueue::new(30_000)),
        )
    }

    async fn submitted(
        storage: &Arc<dyn StorageCache>,
        queue: &Arc<dyn QueueBackend>,
        id: &str,
    ) -> QueryId {
        submit(storage, queue, new_query(id, "seq", &[])).await.query_id
    }

    // ============================================================
    // EXPIRY
    // ============================================================

    #[tokio::test]
    async fn test_expired_query_is_canceled_and_revoked() {
        // ARRANGE: a query whose only task is claimed by a worker
        let (storage, queue) = backends();
        let query_id = submitted(&storage, &queue, "stale").await;
        let claim = queue.claim(Duration::from_millis(50)).await.unwrap().unwrap();
        let monitor = QueryMonitor::new(storage.clone(), queue.clone(), monitor_config());

        // ACT
        let report = monitor.sweep(now_ms() + 2 * TIMEOUT_MS).await.unwrap();

        // ASSERT
        assert_eq!(
            report,
            SweepReport {
                canceled: 1,
                deleted: 0,
                released_claims: 1,
                failed_tasks: 1,
                skipped: false,
            }
        );
        let state = storage.get_query(&query_id).await.unwrap();
        assert_eq!(state.status, QueryStatus::Canceled);
        assert!(state.failure.unwrap().starts_with("expired"));
        assert!(
            storage
                .get_tasks(&query_id)
                .await
                .unwrap()
                .iter()
                .all(|t| t.state == TaskState::Failed)
        );
        assert!(matches!(
            queue.acknowledge(&claim).await,
            Err(QueryStorageError::ClaimExpired(_))
        ));
        assert_eq!(queue.stats().await.unwrap().queued, 0);
    }

    #[tokio::test]
    async fn test_sweep_is_idempotent() {
        let (storage, queue) = backends();
        submitted(&storage, &queue, "stale").await;
        let monitor = QueryMonitor::new(storage.clone(), queue.clone(), monitor_config());
        let now = now_ms() + 2 * TIMEOUT_MS;

        let first = monitor.sweep(now).await.unwrap();
        let second = monitor.sweep(now).await.unwrap();

        assert_eq!(first.canceled, 1);
        assert_eq!(second, SweepReport::default());
    }

    #[tokio::test]
    async fn test_polled_query_is_left_alone() {
        let (storage, queue) = backends();
        let query_id = submitted(&storage, &queue, "fresh").await;
        let monitor = QueryMonitor::new(storage.clone(), queue.clone(), monitor_config());

        let report = monitor.sweep(now_ms()).await.unwrap();

        assert_eq!(report, SweepReport::default());
        assert_eq!(
            storage.get_query(&query_id).await.unwrap().status,
            QueryStatus::Defined
        );
        assert_eq!(queue.stats().await.unwrap().queued, 1);
    }

    // ============================================================
    // REAPING
    // ============================================================

    #[tokio::test]
    async fn test_finished_query_is_deleted_after_grace() {
        // ARRANGE: a closed query with every task done
        let (storage, queue) = backends();
        let query_id = submitted(&storage, &queue, "done").await;
        storage
            .update_task_state(&TaskKey::new(query_id.clone(), 0), TaskState::Completed)
            .await
            .unwrap();
        storage
            .update_query_status(&query_id, QueryStatus::Closed, None)
            .await
            .unwrap();
        let monitor = QueryMonitor::new(storage.clone(), queue.clone(), monitor_config());

        // ACT + ASSERT: still within the grace period
        assert_eq!(monitor.sweep(now_ms()).await.unwrap().deleted, 0);
        assert!(storage.get_query(&query_id).await.is_ok());

        // ACT + ASSERT: past it
        let report = monitor.sweep(now_ms() + 2 * GRACE_MS).await.unwrap();
        assert_eq!(report.deleted, 1);
        assert!(matches!(
            storage.get_query(&query_id).await,
            Err(QueryStorageError::NotFound(_))
        ));
        assert_eq!(queue.stats().await.unwrap().queued, 0);
    }

    #[tokio::test]
    async fn test_stale_running_task_of_failed_query_is_failed_then_deleted() {
        // ARRANGE: a worker died while running the task of a query that later failed
        let (storage, queue) = backends();
        let query_id = submitted(&storage, &queue, "orphan").await;
        let key = TaskKey::new(query_id.clone(), 0);
        storage.update_task_state(&key, TaskState::Running).await.unwrap();
        storage
            .update_query_status(&query_id, QueryStatus::Failed, Some("boom".into()))
            .await
            .unwrap();
        let monitor = QueryMonitor::new(storage.clone(), queue.clone(), monitor_config());
        let later = now_ms() + 2 * TIMEOUT_MS;

        // ACT
        let first = monitor.sweep(later).await.unwrap();
        let second = monitor.sweep(later).await.unwrap();

        // ASSERT: failed first, deleted on the next pass
        assert_eq!(first.failed_tasks, 1);
        assert_eq!(first.deleted, 0);
        assert_eq!(second.deleted, 1);
        assert!(storage.list_queries().await.unwrap().is_empty());
    }

    // ============================================================
    // SWEEPS
    // ============================================================

    /// Storage whose listing is slow, so two sweeps overlap.
    struct SlowListing(SyncStorageCache);

    #[async_trait]
    impl StorageCache for SlowListing {
        async fn execute(&self, op: StorageOp) -> Result<OpOutcome> {
            self.0.execute(op).await
        }

        async fn load(&self, query_id: &QueryId) -> Result<Option<QueryRecord>> {
            self.0.load(query_id).await
        }

        async fn load_all(&self) -> Result<Vec<QueryRecord>> {
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.0.load_all().await
        }

        async fn clear(&self) -> Result<usize> {
            self.0.clear().await
        }
    }

    #[tokio::test]
    async fn test_overlapping_sweep_is_skipped() {
        // ARRANGE
        let storage: Arc<dyn StorageCache> = Arc::new(SlowListing(SyncStorageCache::new()));
        let queue: Arc<dyn QueueBackend> = Arc::new(LocalQueue::new(30_000));
        submitted(&storage, &queue, "stale").await;
        let monitor = QueryMonitor::new(storage.clone(), queue.clone(), monitor_config());
        let now = now_ms() + 2 * TIMEOUT_MS;

        // ACT
        let (a, b) = tokio::join!(monitor.sweep(now), monitor.sweep(now));

        // ASSERT: exactly one sweep did the work
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(a.skipped != b.skipped);
        assert_eq!(a.canceled + b.canceled, 1);
    }

    #[tokio::test]
    async fn test_background_loop_cancels_and_stops() {
        // ARRANGE
        let (storage, queue) = backends();
        let query_id = submitted(&storage, &queue, "abandoned").await;
        let mut config = monitor_config();
        config.query_timeout_ms = 50;
        let monitor = QueryMonitor::new(storage.clone(), queue.clone(), config);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // ACT
        let handle = monitor.start(shutdown_rx);
        let mut status = QueryStatus::Defined;
        for _ in 0..100 {
            status = storage.get_query(&query_id).await.unwrap().status;
            if status == QueryStatus::Canceled {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown_tx.send(true).unwrap();

        // ASSERT
        assert_eq!(status, QueryStatus::Canceled);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("monitor did not stop")
            .unwrap();
    }
}
