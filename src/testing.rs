//! Fixtures shared by the unit tests of several modules.

use crate::cluster::membership::MembershipService;
use crate::cluster::partitioner::PartitionManager;
use crate::cluster::peer::PeerClient;
use crate::queue::backend::QueueBackend;
use crate::queue::types::QueuedTask;
use crate::retry::RetryPolicy;
use crate::storage::cache::StorageCache;
use crate::storage::types::{NewQuery, QueryId, QueryState, TaskSpec};

use std::sync::Arc;

/// Membership of a cluster with only this node, bound to ephemeral ports.
pub async fn single_node_membership() -> Arc<MembershipService> {
    MembershipService::new(
        "127.0.0.1:0".parse().unwrap(),
        "127.0.0.1:0".parse().unwrap(),
        vec![],
    )
    .await
    .expect("Failed to bind membership socket")
}

pub async fn single_node_cluster(partitions: u32) -> (Arc<PartitionManager>, Arc<PeerClient>) {
    let membership = single_node_membership().await;
    let partitioner = Arc::new(PartitionManager::new(membership.clone(), partitions, 2));
    let peers = Arc::new(PeerClient::new(membership, RetryPolicy::once()));
    (partitioner, peers)
}

/// A query with one CREATE task per delegate, or a single one for a plain query.
pub fn new_query(id: &str, logic: &str, delegates: &[&str]) -> NewQuery {
    let initial_tasks = if delegates.is_empty() {
        vec![TaskSpec::create(None)]
    } else {
        delegates
            .iter()
            .map(|d| TaskSpec::create(Some(d.to_string())))
            .collect()
    };
    NewQuery {
        query_id: QueryId::from(id),
        query_logic: logic.to_string(),
        query_pool: "default".to_string(),
        parameters: serde_json::json!({}),
        delegates: delegates.iter().map(|d| d.to_string()).collect(),
        initial_tasks,
    }
}

/// Creates the query and publishes its initial tasks, the way submission does.
pub async fn submit(
    storage: &Arc<dyn StorageCache>,
    queue: &Arc<dyn QueueBackend>,
    query: NewQuery,
) -> QueryState {
    let state = storage
        .create_query(query)
        .await
        .expect("Failed to create query");
    for task in storage.get_tasks(&state.query_id).await.expect("query exists") {
        queue
            .publish(QueuedTask::from(&task))
            .await
            .expect("Failed to publish task");
    }
    state
}
