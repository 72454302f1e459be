use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    routing::get,
};
use std::sync::Arc;

use super::query_service::QueryService;
use crate::cluster::peer::Reply;
use crate::storage::types::{QueryId, QueryState, TaskDescription};

/// Read-only introspection routes.
pub fn router(service: Arc<QueryService>) -> Router {
    Router::new()
        .route("/queries", get(handle_list_queries))
        .route("/queries/running", get(handle_running_queries))
        .route("/queries/:query_id", get(handle_get_query))
        .route("/queries/:query_id/tasks", get(handle_get_tasks))
        .route("/logics", get(handle_list_logics))
        .layer(Extension(service))
}

pub async fn handle_list_queries(
    Extension(service): Extension<Arc<QueryService>>,
) -> (StatusCode, Json<Reply<Vec<QueryState>>>) {
    Reply::respond(service.list_queries().await)
}

pub async fn handle_running_queries(
    Extension(service): Extension<Arc<QueryService>>,
) -> (StatusCode, Json<Reply<Vec<QueryState>>>) {
    Reply::respond(service.get_running_queries().await)
}

pub async fn handle_get_query(
    Extension(service): Extension<Arc<QueryService>>,
    Path(query_id): Path<String>,
) -> (StatusCode, Json<Reply<QueryState>>) {
    Reply::respond(service.get_query(&QueryId(query_id)).await)
}

pub async fn handle_get_tasks(
    Extension(service): Extension<Arc<QueryService>>,
    Path(query_id): Path<String>,
) -> (StatusCode, Json<Reply<Vec<TaskDescription>>>) {
    Reply::respond(service.get_tasks(&QueryId(query_id)).await)
}

pub async fn handle_list_logics(
    Extension(service): Extension<Arc<QueryService>>,
) -> (StatusCode, Json<Vec<String>>) {
    (StatusCode::OK, Json(service.registry().list()))
}
