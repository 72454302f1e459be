use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    routing::{get, post},
};
use std::sync::Arc;

use super::distributed::DistributedStorageCache;
use super::protocol::*;
use super::record::{OpOutcome, QueryRecord};
use super::types::QueryId;
use crate::cluster::peer::Reply;

/// Internal routes of the distributed storage cache.
pub fn router(cache: Arc<DistributedStorageCache>) -> Router {
    Router::new()
        .route(ENDPOINT_EXECUTE, post(handle_execute))
        .route(ENDPOINT_REPLICATE, post(handle_replicate))
        .route(&format!("{}/:query_id", ENDPOINT_RECORD), get(handle_get_record))
        .route(ENDPOINT_RECORDS, get(handle_list_records))
        .route(ENDPOINT_CLEAR, post(handle_clear))
        .layer(Extension(cache))
}

pub async fn handle_execute(
    Extension(cache): Extension<Arc<DistributedStorageCache>>,
    Json(req): Json<ForwardOpRequest>,
) -> (StatusCode, Json<Reply<OpOutcome>>) {
    Reply::respond(
        cache
            .execute_as_primary(req.partition, req.op_id, req.op)
            .await,
    )
}

pub async fn handle_replicate(
    Extension(cache): Extension<Arc<DistributedStorageCache>>,
    Json(req): Json<ReplicateRequest>,
) -> (StatusCode, Json<Reply<bool>>) {
    let partition = req.partition;
    let stored = cache.store_replica(req);
    if stored {
        tracing::debug!("Stored replica for partition {}", partition);
    } else {
        tracing::debug!("Ignored stale replica for partition {}", partition);
    }
    Reply::respond(Ok(stored))
}

pub async fn handle_get_record(
    Extension(cache): Extension<Arc<DistributedStorageCache>>,
    Path(query_id): Path<String>,
) -> (StatusCode, Json<Reply<Option<QueryRecord>>>) {
    Reply::respond(Ok(cache.get_local(&QueryId(query_id))))
}

pub async fn handle_list_records(
    Extension(cache): Extension<Arc<DistributedStorageCache>>,
) -> (StatusCode, Json<Reply<Vec<QueryRecord>>>) {
    Reply::respond(Ok(cache.primary_records()))
}

pub async fn handle_clear(
    Extension(cache): Extension<Arc<DistributedStorageCache>>,
) -> (StatusCode, Json<Reply<usize>>) {
    let cleared = cache.clear_local();
    tracing::info!("Cleared {} local queries on request", cleared);
    Reply::respond(Ok(cleared))
}
