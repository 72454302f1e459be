//! Node-to-node HTTP client.
//!
//! Every internal endpoint answers with a [`Reply`], so a peer's error reaches the
//! caller with its original [`QueryStorageError`] variant. Transport failures become
//! `BackendUnavailable` and are retried with backoff.

use super::membership::MembershipService;
use super::types::NodeId;
use crate::error::{QueryStorageError, Result, WireError};
use crate::retry::{RetryPolicy, with_backoff};

use axum::Json;
use axum::http::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_millis(2_000);

#[derive(Debug, Serialize, Deserialize)]
pub enum Reply<T> {
    Ok(T),
    Err(WireError),
}

impl<T> Reply<T> {
    /// Turns a handler result into the response tuple every internal endpoint returns.
    pub fn respond(result: Result<T>) -> (StatusCode, Json<Reply<T>>) {
        match result {
            Ok(value) => (StatusCode::OK, Json(Reply::Ok(value))),
            Err(e) => {
                let status = StatusCode::from_u16(e.http_status())
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                if status.is_server_error() {
                    tracing::error!("Internal request failed: {}", e);
                } else {
                    tracing::debug!("Internal request rejected: {}", e);
                }
                (status, Json(Reply::Err(WireError::from(&e))))
            }
        }
    }

    fn into_result(self) -> Result<T> {
        match self {
            Reply::Ok(value) => Ok(value),
            Reply::Err(e) => Err(e.into()),
        }
    }
}

pub struct PeerClient {
    http_client: reqwest::Client,
    membership: Arc<MembershipService>,
    retry: RetryPolicy,
}

impl PeerClient {
    pub fn new(membership: Arc<MembershipService>, retry: RetryPolicy) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            membership,
            retry,
        }
    }

    pub fn membership(&self) -> &Arc<MembershipService> {
        &self.membership
    }

    fn url(&self, node_id: &NodeId, path: &str) -> Result<String> {
        let node = self.membership.get_member(node_id).ok_or_else(|| {
            QueryStorageError::BackendUnavailable(format!("node {} is not a member", node_id))
        })?;
        Ok(format!("http://{}{}", node.http_addr, path))
    }

    pub async fn post<Req, Resp>(&self, node_id: &NodeId, path: &str, payload: &Req) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let url = self.url(node_id, path)?;
        let (client, target) = (&self.http_client, url.as_str());
        with_backoff(&self.retry, target, move || async move {
            let response = client
                .post(target)
                .json(payload)
                .timeout(REQUEST_TIMEOUT)
                .send()
                .await?;
            decode(target, response).await
        })
        .await
    }

    pub async fn get<Resp>(&self, node_id: &NodeId, path: &str) -> Result<Resp>
    where
        Resp: DeserializeOwned,
    {
        let url = self.url(node_id, path)?;
        let (client, target) = (&self.http_client, url.as_str());
        with_backoff(&self.retry, target, move || async move {
            let response = client
                .get(target)
                .timeout(REQUEST_TIMEOUT)
                .send()
                .await?;
            decode(target, response).await
        })
        .await
    }
}

async fn decode<Resp: DeserializeOwned>(url: &str, response: reqwest::Response) -> Result<Resp> {
    let status = response.status();
    match response.json::<Reply<Resp>>().await {
        Ok(reply) => reply.into_result(),
        Err(e) => Err(QueryStorageError::BackendUnavailable(format!(
            "{} answered {} with an unreadable body: {}",
            url, status, e
        ))),
    }
}
