//! Queue Module Tests
//!
//! ## Test Scopes
//! - **Exclusivity**: concurrent claims, lease expiry, release and renewal.
//! - **Ordering**: CREATE -> NEXT per delegate, CLOSE last, one CLOSE per query.
//! - **Backends**: behavior tests run against `LocalQueue` and a single-node
//!   `DistributedQueue`.

#[cfg(test)]
mod tests {
    use crate::error::QueryStorageError;
    use crate::queue::backend::QueueBackend;
    use crate::queue::distributed::DistributedQueue;
    use crate::queue::local::LocalQueue;
    use crate::queue::pool::{PooledTask, TaskPool};
    use crate::queue::protocol::{QueueReplica, ReplicateQueueRequest};
    use crate::queue::types::QueuedTask;
    use crate::storage::types::{QueryId, TaskKey, TaskKind};
    use crate::testing::single_node_cluster;
    use std::sync::Arc;
    use std::time::Duration;

    const SHORT: Duration = Duration::from_millis(50);

    fn task(query: &str, id: u64, kind: TaskKind) -> QueuedTask {
        QueuedTask {
            key: TaskKey::new(QueryId::from(query), id),
            kind,
            delegate: None,
        }
    }

    async fn distributed(lease_ms: u64) -> Arc<DistributedQueue> {
        let (partitioner, peers) = single_node_cluster(16).await;
        Arc::new(DistributedQueue::new(partitioner, peers, lease_ms))
    }

    async fn backends(lease_ms: u64) -> Vec<(&'static str, Arc<dyn QueueBackend>)> {
        vec![
            ("local", Arc::new(LocalQueue::new(lease_ms)) as Arc<dyn QueueBackend>),
            ("distributed", distributed(lease_ms).await as Arc<dyn QueueBackend>),
        ]
    }

    // ============================================================
    // EXCLUSIVITY
    // ============================================================

    #[tokio::test]
    async fn test_concurrent_claims_have_single_winner() {
        for (name, queue) in backends(30_000).await {
            // ARRANGE
            queue.publish(task("q", 0, TaskKind::Create)).await.unwrap();

            // ACT: eight workers race for the one task
            let mut handles = Vec::new();
            for _ in 0..8 {
                let queue = queue.clone();
                handles.push(tokio::spawn(async move {
                    queue.claim(Duration::from_millis(100)).await.unwrap()
                }));
            }
            let mut winners = 0;
            for handle in handles {
                if handle.await.unwrap().is_some() {
                    winners += 1;
                }
            }

            // ASSERT
            assert_eq!(winners, 1, "{}", name);
        }
    }

    #[tokio::test]
    async fn test_claim_times_out_on_empty_queue() {
        for (name, queue) in backends(30_000).await {
            let started = tokio::time::Instant::now();

            let claim = queue.claim(SHORT).await.unwrap();

            assert!(claim.is_none(), "{}", name);
            assert!(started.elapsed() >= SHORT, "{}", name);
        }
    }

    #[tokio::test]
    async fn test_expired_lease_is_claimable_again() {
        for (name, queue) in backends(30).await {
            queue.publish(task("q", 0, TaskKind::Create)).await.unwrap();
            let first = queue.claim(SHORT).await.unwrap().unwrap();

            tokio::time::sleep(Duration::from_millis(60)).await;
            let second = queue.claim(SHORT).await.unwrap().unwrap();

            assert_eq!(first.task, second.task, "{}", name);
            assert_ne!(first.token, second.token, "{}", name);
            assert!(
                matches!(
                    queue.acknowledge(&first).await,
                    Err(QueryStorageError::ClaimExpired(_))
                ),
                "{}: the first holder lost its claim",
                name
            );
            queue.acknowledge(&second).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_release_hands_task_to_next_claimer() {
        for (name, queue) in backends(30_000).await {
            queue.publish(task("q", 0, TaskKind::Create)).await.unwrap();
            let claim = queue.claim(SHORT).await.unwrap().unwrap();
            assert!(queue.claim(SHORT).await.unwrap().is_none(), "{}", name);

            queue.release(&claim).await.unwrap();

            let again = queue.claim(SHORT).await.unwrap();
            assert_eq!(again.map(|c| c.task), Some(claim.task.clone()), "{}", name);
            assert!(
                matches!(queue.release(&claim).await, Err(QueryStorageError::ClaimExpired(_))),
                "{}: a released claim cannot be used twice",
                name
            );
        }
    }

    #[tokio::test]
    async fn test_renew_keeps_claim_alive() {
        for (name, queue) in backends(200).await {
            queue.publish(task("q", 0, TaskKind::Create)).await.unwrap();
            let claim = queue.claim(SHORT).await.unwrap().unwrap();

            tokio::time::sleep(Duration::from_millis(120)).await;
            let expires_at = queue.renew(&claim).await.unwrap();
            tokio::time::sleep(Duration::from_millis(120)).await;

            assert!(expires_at > claim.expires_at, "{}", name);
            assert!(queue.claim(SHORT).await.unwrap().is_none(), "{}", name);
            queue.acknowledge(&claim).await.unwrap();
            assert_eq!(queue.stats().await.unwrap().queued, 0, "{}", name);
        }
    }

    #[tokio::test]
    async fn test_revoke_invalidates_outstanding_claims() {
        for (name, queue) in backends(30_000).await {
            // ARRANGE
            queue.publish(task("doomed", 0, TaskKind::Create)).await.unwrap();
            queue.publish(task("doomed", 1, TaskKind::Create)).await.unwrap();
            let claim = queue.claim(SHORT).await.unwrap().unwrap();
            queue.publish(task("other", 0, TaskKind::Create)).await.unwrap();

            // ACT
            let released = queue.revoke_query(&QueryId::from("doomed")).await.unwrap();

            // ASSERT
            assert_eq!(released, 1, "{}", name);
            assert!(
                matches!(queue.acknowledge(&claim).await, Err(QueryStorageError::ClaimExpired(_))),
                "{}",
                name
            );
            let stats = queue.stats().await.unwrap();
            assert_eq!(stats.queued, 1, "{}", name);
            assert_eq!(stats.claimed, 0, "{}", name);
            let next = queue.claim(SHORT).await.unwrap().unwrap();
            assert_eq!(next.task.query_id(), &QueryId::from("other"), "{}", name);
        }
    }

    // ============================================================
    // ORDERING
    // ============================================================

    #[tokio::test]
    async fn test_create_next_close_order() {
        for (name, queue) in backends(30_000).await {
            // ARRANGE
            queue.publish(task("q", 0, TaskKind::Create)).await.unwrap();
            queue.publish(task("q", 1, TaskKind::Next)).await.unwrap();
            queue.publish(task("q", 2, TaskKind::Close)).await.unwrap();

            // ACT + ASSERT: each step unlocks only the next kind
            let create = queue.claim(SHORT).await.unwrap().unwrap();
            assert_eq!(create.task.kind, TaskKind::Create, "{}", name);
            assert!(
                queue.claim(SHORT).await.unwrap().is_none(),
                "{}: NEXT must wait for the CREATE",
                name
            );

            queue.acknowledge(&create).await.unwrap();
            let next = queue.claim(SHORT).await.unwrap().unwrap();
            assert_eq!(next.task.kind, TaskKind::Next, "{}", name);
            assert!(
                queue.claim(SHORT).await.unwrap().is_none(),
                "{}: CLOSE must wait for everything before it",
                name
            );

            queue.acknowledge(&next).await.unwrap();
            let close = queue.claim(SHORT).await.unwrap().unwrap();
            assert_eq!(close.task.kind, TaskKind::Close, "{}", name);
            queue.acknowledge(&close).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_second_close_is_rejected() {
        for (name, queue) in backends(30_000).await {
            queue.publish(task("q", 5, TaskKind::Close)).await.unwrap();
            let close = queue.claim(SHORT).await.unwrap().unwrap();
            queue.acknowledge(&close).await.unwrap();

            let again = queue.publish(task("q", 6, TaskKind::Close)).await;

            assert!(
                matches!(again, Err(QueryStorageError::InvalidTransition(_))),
                "{}",
                name
            );
        }
    }

    #[tokio::test]
    async fn test_queries_are_served_in_publish_order() {
        for (name, queue) in backends(30_000).await {
            queue.publish(task("first", 0, TaskKind::Create)).await.unwrap();
            queue.publish(task("second", 0, TaskKind::Create)).await.unwrap();

            let a = queue.claim(SHORT).await.unwrap().unwrap();
            let b = queue.claim(SHORT).await.unwrap().unwrap();

            // The distributed backend only orders within a partition.
            if name == "local" {
                assert_eq!(a.task.query_id(), &QueryId::from("first"));
                assert_eq!(b.task.query_id(), &QueryId::from("second"));
            }
            assert_ne!(a.task.query_id(), b.task.query_id(), "{}", name);
        }
    }

    // ============================================================
    // POOL INTERNALS
    // ============================================================

    #[test]
    fn test_republishing_queued_task_is_noop() {
        let mut pool = TaskPool::new();

        let first = pool.publish(task("q", 0, TaskKind::Create)).unwrap();
        let again = pool.publish(task("q", 0, TaskKind::Create)).unwrap();

        assert_eq!(first.seq, again.seq);
        assert_eq!(pool.depth(), 1);
    }

    #[test]
    fn test_claimed_create_still_holds_back_next() {
        let mut pool = TaskPool::new();
        pool.publish(task("q", 0, TaskKind::Create)).unwrap();
        pool.publish(task("q", 1, TaskKind::Next)).unwrap();
        pool.publish(task("q", 2, TaskKind::Create)).unwrap();

        let first = pool.claim("w1", 1_000, 0).unwrap();
        let second = pool.claim("w2", 1_000, 0).unwrap();

        assert_eq!(first.task.key.task_id, 0);
        assert_eq!(second.task.key.task_id, 2, "the later CREATE is not held back");
        assert!(pool.claim("w3", 1_000, 0).is_none());
        assert_eq!(pool.owner_of(&second.task.key, 0).as_deref(), Some("w2"));
        assert_eq!(pool.owner_of(&second.task.key, 1_000), None, "lease lapsed");
    }

    fn delegate_task(id: u64, kind: TaskKind, delegate: &str) -> QueuedTask {
        QueuedTask {
            delegate: Some(delegate.to_string()),
            ..task("q", id, kind)
        }
    }

    #[test]
    fn test_delegate_next_only_waits_for_its_own_create() {
        // ARRANGE: both delegates start; a finishes its CREATE while b's is still running
        let mut pool = TaskPool::new();
        pool.publish(delegate_task(0, TaskKind::Create, "a")).unwrap();
        pool.publish(delegate_task(1, TaskKind::Create, "b")).unwrap();
        let create_a = pool.claim("w1", 1_000, 0).unwrap();
        let create_b = pool.claim("w2", 1_000, 0).unwrap();
        pool.publish(delegate_task(2, TaskKind::Next, "a")).unwrap();
        pool.acknowledge(&create_a, 0).unwrap();
        pool.publish(delegate_task(3, TaskKind::Next, "b")).unwrap();

        // ACT
        let next_a = pool.claim("w1", 1_000, 0).unwrap();

        // ASSERT: a moves on, b's NEXT still waits for b's CREATE
        assert_eq!(next_a.task.key.task_id, 2);
        assert!(pool.claim("w3", 1_000, 0).is_none());
        pool.acknowledge(&create_b, 0).unwrap();
        assert_eq!(pool.claim("w3", 1_000, 0).unwrap().task.key.task_id, 3);
    }

    #[test]
    fn test_restored_entries_keep_position_and_close_flag() {
        let mut backup = TaskPool::new();

        backup.restore(PooledTask {
            seq: 3,
            task: task("q", 9, TaskKind::Close),
        });
        backup.restore(PooledTask {
            seq: 1,
            task: task("q", 4, TaskKind::Next),
        });

        let claim = backup.claim("w", 1_000, 0).unwrap();
        assert_eq!(claim.task.kind, TaskKind::Next);
        assert!(backup.publish(task("q", 10, TaskKind::Close)).is_err());

        assert!(backup.remove(&claim.task.key));
        assert_eq!(backup.depth(), 1);
    }

    #[tokio::test]
    async fn test_distributed_replica_changes_apply_to_backup_copy() {
        let queue = distributed(30_000).await;
        let pooled = PooledTask {
            seq: 0,
            task: task("replicated", 0, TaskKind::Create),
        };

        queue.apply_replica(ReplicateQueueRequest {
            partition: 7,
            change: QueueReplica::Insert(pooled.clone()),
        });
        assert_eq!(queue.local_depth(), 1);

        queue.apply_replica(ReplicateQueueRequest {
            partition: 7,
            change: QueueReplica::Remove(pooled.task.key.clone()),
        });
        assert_eq!(queue.local_depth(), 0);
    }
}
