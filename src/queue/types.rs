use crate::storage::types::{QueryId, TaskDescription, TaskKey, TaskKind};
use serde::{Deserialize, Serialize};

/// What the queue carries for one task: just enough to route and order it.
/// The authoritative task state stays in the storage cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueuedTask {
    pub key: TaskKey,
    pub kind: TaskKind,
    pub delegate: Option<String>,
}

impl QueuedTask {
    pub fn query_id(&self) -> &QueryId {
        &self.key.query_id
    }
}

impl From<&TaskDescription> for QueuedTask {
    fn from(task: &TaskDescription) -> Self {
        Self {
            key: task.key.clone(),
            kind: task.kind,
            delegate: task.delegate.clone(),
        }
    }
}

/// Exclusive, time-limited right to process one queued task.
///
/// The `token` identifies this particular claim: once the lease lapses and the task is
/// claimed again, the old token no longer acknowledges, releases or renews anything.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claim {
    pub task: QueuedTask,
    pub token: String,
    pub owner: String,
    pub expires_at: u64,
}
