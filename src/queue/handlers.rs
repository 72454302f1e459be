use axum::{Json, Router, extract::Extension, http::StatusCode, routing::post};
use std::sync::Arc;

use super::distributed::DistributedQueue;
use super::protocol::*;
use crate::cluster::peer::Reply;

/// Internal routes of the distributed queue.
pub fn router(queue: Arc<DistributedQueue>) -> Router {
    Router::new()
        .route(ENDPOINT_QUEUE_PUBLISH, post(handle_publish))
        .route(ENDPOINT_QUEUE_REVOKE, post(handle_revoke))
        .route(ENDPOINT_QUEUE_REPLICATE, post(handle_replicate))
        .layer(Extension(queue))
}

/// Publish forwarded by a node that is not the partition primary.
pub async fn handle_publish(
    Extension(queue): Extension<Arc<DistributedQueue>>,
    Json(req): Json<PublishRequest>,
) -> (StatusCode, Json<Reply<()>>) {
    tracing::debug!("Received forwarded task {}", req.task.key);
    Reply::respond(queue.publish_as_primary(req.partition, req.task).await)
}

pub async fn handle_revoke(
    Extension(queue): Extension<Arc<DistributedQueue>>,
    Json(req): Json<RevokeRequest>,
) -> (StatusCode, Json<Reply<usize>>) {
    Reply::respond(Ok(queue
        .revoke_as_primary(req.partition, &req.query_id)
        .await))
}

pub async fn handle_replicate(
    Extension(queue): Extension<Arc<DistributedQueue>>,
    Json(req): Json<ReplicateQueueRequest>,
) -> (StatusCode, Json<Reply<()>>) {
    tracing::trace!("Applying queue replica for partition {}", req.partition);
    queue.apply_replica(req);
    Reply::respond(Ok(()))
}
