use crate::storage::types::{Checkpoint, MergePolicy, QueryId, ResultsPage, TaskKey};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Everything a query logic gets for one unit of work.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub query_id: QueryId,
    pub task: TaskKey,
    /// Set when the task belongs to a delegate of a composite query.
    pub delegate: Option<String>,
    /// Latest checkpoint of the task, `None` for a fresh CREATE.
    pub checkpoint: Option<Checkpoint>,
    pub page_size: usize,
    pub parameters: serde_json::Value,
}

impl ExecutionRequest {
    /// Resume position of the checkpoint, if any.
    pub fn resume_position(&self) -> Option<&serde_json::Value> {
        self.checkpoint.as_ref().map(|c| &c.resume_position)
    }
}

/// Whether the logic has more to produce after this page.
#[derive(Debug, Clone, PartialEq)]
pub enum Resume {
    /// More results exist; resume from this position.
    Continue(serde_json::Value),
    Done,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogicOutput {
    pub page: ResultsPage,
    pub next: Resume,
}

impl LogicOutput {
    /// A page with more to come from `position`.
    pub fn partial(results: Vec<serde_json::Value>, position: serde_json::Value) -> Self {
        Self {
            page: ResultsPage::partial(results),
            next: Resume::Continue(position),
        }
    }

    /// The last page.
    pub fn complete(results: Vec<serde_json::Value>) -> Self {
        Self {
            page: ResultsPage::complete(results),
            next: Resume::Done,
        }
    }
}

/// A resumable producer of results, looked up by name in the registry.
#[async_trait]
pub trait QueryLogic: Send + Sync {
    async fn execute(&self, request: ExecutionRequest) -> anyhow::Result<LogicOutput>;

    /// Releases whatever the logic holds for `query_id`. Runs once per query, for its
    /// CLOSE task.
    async fn close(&self, _query_id: &QueryId) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A query logic made of several delegate logics whose results are merged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompositeDefinition {
    pub name: String,
    pub delegates: Vec<String>,
    #[serde(default)]
    pub merge: MergePolicy,
}
