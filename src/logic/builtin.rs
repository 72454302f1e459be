//! Built-in query logics.

use super::types::*;
use crate::storage::types::QueryId;

use async_trait::async_trait;
use serde_json::{Value, json};

/// Produces `count` consecutive integers starting at `start`, one page at a time.
///
/// Parameters: `{"count": n, "start": s}`; a composite delegate may override them under
/// `{"delegates": {"<name>": {...}}}`. With a label the values are strings such as `"a3"`.
#[derive(Debug, Default)]
pub struct SequenceLogic {
    label: Option<String>,
}

const DEFAULT_COUNT: u64 = 10;

impl SequenceLogic {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn labeled(label: &str) -> Self {
        Self {
            label: Some(label.to_string()),
        }
    }

    fn param(request: &ExecutionRequest, key: &str) -> Option<u64> {
        request
            .delegate
            .as_ref()
            .and_then(|d| request.parameters["delegates"][d][key].as_u64())
            .or_else(|| request.parameters[key].as_u64())
    }

    fn value(&self, n: u64) -> Value {
        match &self.label {
            Some(label) => json!(format!("{}{}", label, n)),
            None => json!(n),
        }
    }
}

#[async_trait]
impl QueryLogic for SequenceLogic {
    async fn execute(&self, request: ExecutionRequest) -> anyhow::Result<LogicOutput> {
        let start = Self::param(&request, "start").unwrap_or(0);
        let end = start + Self::param(&request, "count").unwrap_or(DEFAULT_COUNT);

        let from = match request.resume_position() {
            Some(position) => position["next"]
                .as_u64()
                .ok_or_else(|| anyhow::anyhow!("malformed resume position: {}", position))?,
            None => start,
        };
        let to = end.min(from + request.page_size.max(1) as u64);

        let results = (from..to).map(|n| self.value(n)).collect();
        if to >= end {
            Ok(LogicOutput::complete(results))
        } else {
            Ok(LogicOutput::partial(results, json!({ "next": to })))
        }
    }

    async fn close(&self, query_id: &QueryId) -> anyhow::Result<()> {
        tracing::debug!("Sequence logic closed for query {}", query_id);
        Ok(())
    }
}
