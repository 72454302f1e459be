use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier of a query within the cluster.
///
/// Wrapper around a UUID string. Hashed to pick the partition that owns the
/// query's state and its queued tasks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryId(pub String);

impl QueryId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for QueryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for QueryId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Identity of one task: the owning query plus a per-query sequence number.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskKey {
    pub query_id: QueryId,
    pub task_id: u64,
}

impl TaskKey {
    pub fn new(query_id: QueryId, task_id: u64) -> Self {
        Self { query_id, task_id }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.query_id, self.task_id)
    }
}

/// What a task asks the executor to do.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskKind {
    /// First unit of work: start the query logic from scratch.
    Create,
    /// Resume the query logic from the task's checkpoint.
    Next,
    /// Release whatever the query logic holds for this query.
    Close,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Running,
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}

/// Counters accumulated across every checkpoint of a task chain.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CheckpointMetrics {
    pub results: u64,
    pub pages: u64,
    pub elapsed_ms: u64,
}

impl CheckpointMetrics {
    /// Metrics after one more page of `results` rows took `elapsed_ms`.
    pub fn advance(&self, results: usize, elapsed_ms: u64) -> Self {
        Self {
            results: self.results + results as u64,
            pages: self.pages + 1,
            elapsed_ms: self.elapsed_ms + elapsed_ms,
        }
    }
}

/// Immutable resumption state for one task.
///
/// `delegate` is only set for tasks of a composite query and names the
/// delegate query logic the checkpoint belongs to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub task: TaskKey,
    pub delegate: Option<String>,
    /// Opaque to storage; only the query logic that wrote it interprets it.
    pub resume_position: serde_json::Value,
    pub metrics: CheckpointMetrics,
    pub created_at: u64,
}

impl Checkpoint {
    pub fn new(
        task: TaskKey,
        delegate: Option<String>,
        resume_position: serde_json::Value,
        metrics: CheckpointMetrics,
    ) -> Self {
        Self {
            task,
            delegate,
            resume_position,
            metrics,
            created_at: now_ms(),
        }
    }

    /// Copy of this checkpoint addressed to another task (a continuation).
    pub fn rebind(&self, task: TaskKey) -> Self {
        Self {
            task,
            delegate: self.delegate.clone(),
            resume_position: self.resume_position.clone(),
            metrics: self.metrics,
            created_at: now_ms(),
        }
    }
}

/// Request to create one task inside a query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSpec {
    pub kind: TaskKind,
    pub delegate: Option<String>,
    /// Checkpoint the new task starts from. Rebound to the new task's key.
    pub resume: Option<Checkpoint>,
}

impl TaskSpec {
    pub fn create(delegate: Option<String>) -> Self {
        Self {
            kind: TaskKind::Create,
            delegate,
            resume: None,
        }
    }

    pub fn next(checkpoint: Checkpoint) -> Self {
        Self {
            kind: TaskKind::Next,
            delegate: checkpoint.delegate.clone(),
            resume: Some(checkpoint),
        }
    }

    pub fn close() -> Self {
        Self {
            kind: TaskKind::Close,
            delegate: None,
            resume: None,
        }
    }
}

/// Snapshot of a task as seen by callers: identity, scheduling metadata and
/// the authoritative (latest) checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskDescription {
    pub key: TaskKey,
    pub kind: TaskKind,
    pub state: TaskState,
    pub delegate: Option<String>,
    pub checkpoint: Option<Checkpoint>,
    pub checkpoint_count: usize,
    pub created_at: u64,
    pub last_updated_at: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum QueryStatus {
    Defined,
    Running,
    Closed,
    Canceled,
    Failed,
}

impl QueryStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            QueryStatus::Closed | QueryStatus::Canceled | QueryStatus::Failed
        )
    }

    /// Whether a query may move from `self` to `next`.
    ///
    /// DEFINED -> RUNNING -> CLOSED only moves forward; CANCELED and FAILED can be
    /// entered from any non-terminal status. Re-entering the current status is allowed
    /// and is a no-op.
    pub fn can_transition_to(self, next: QueryStatus) -> bool {
        if self == next {
            return true;
        }
        match (self, next) {
            (QueryStatus::Defined, _) => next != QueryStatus::Defined,
            (QueryStatus::Running, QueryStatus::Closed)
            | (QueryStatus::Running, QueryStatus::Canceled)
            | (QueryStatus::Running, QueryStatus::Failed) => true,
            _ => false,
        }
    }
}

/// Completion tracking for one delegate of a composite query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DelegateState {
    pub name: String,
    pub complete: bool,
}

/// The aggregate record for one query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryState {
    pub query_id: QueryId,
    pub query_logic: String,
    pub query_pool: String,
    pub parameters: serde_json::Value,
    pub status: QueryStatus,
    /// Task ids in creation order.
    pub task_ids: Vec<u64>,
    /// Empty for plain queries.
    pub delegates: Vec<DelegateState>,
    /// Cause recorded when the query FAILED or was CANCELED.
    pub failure: Option<String>,
    pub num_results: u64,
    pub created_at: u64,
    pub last_checked_at: u64,
}

impl QueryState {
    pub fn is_expired(&self, now: u64, timeout_ms: u64) -> bool {
        now.saturating_sub(self.last_checked_at) >= timeout_ms
    }

    pub fn is_composite(&self) -> bool {
        !self.delegates.is_empty()
    }
}

/// Everything needed to create a query record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewQuery {
    pub query_id: QueryId,
    pub query_logic: String,
    pub query_pool: String,
    pub parameters: serde_json::Value,
    pub delegates: Vec<String>,
    pub initial_tasks: Vec<TaskSpec>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PageStatus {
    /// No results, and none expected from this call.
    None,
    /// Results present; more may follow.
    Partial,
    /// Final page, or no results because the query is finished.
    Complete,
}

/// A batch of results plus a completeness signal.
///
/// The status is fixed when the page is built.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultsPage<T = serde_json::Value> {
    results: Vec<T>,
    status: PageStatus,
}

impl<T> ResultsPage<T> {
    pub fn new(results: Vec<T>, status: PageStatus) -> Self {
        Self { results, status }
    }

    pub fn none() -> Self {
        Self::new(Vec::new(), PageStatus::None)
    }

    pub fn partial(results: Vec<T>) -> Self {
        Self::new(results, PageStatus::Partial)
    }

    pub fn complete(results: Vec<T>) -> Self {
        Self::new(results, PageStatus::Complete)
    }

    pub fn results(&self) -> &[T] {
        &self.results
    }

    pub fn status(&self) -> PageStatus {
        self.status
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn into_results(self) -> Vec<T> {
        self.results
    }
}

/// How buffered pages of a composite query's delegates are interleaved.
/// Neither policy lets one delegate starve another.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Rotate across delegates that have something buffered.
    #[default]
    RoundRobin,
    /// Serve pages in the order they were produced.
    Fifo,
}

/// A produced page waiting for a consumer, tagged with the delegate lane it came from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BufferedPage {
    pub lane: Option<String>,
    pub results: Vec<serde_json::Value>,
}

/// Bounds applied when a task's page is recorded. Zero disables a bound.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PageLimits {
    /// Results a query may produce in total; the page that reaches it is cut and
    /// finishes its task.
    pub max_results: u64,
    /// Buffered pages at which the continuation is parked instead of queued.
    pub max_buffered_pages: usize,
}

/// What recording a page did besides storing it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum FollowUp {
    /// A continuation was added and has to be queued.
    Continue(TaskDescription),
    /// A continuation was added but waits until a consumer drains the buffer.
    Parked(TaskDescription),
    /// No continuation: the query is closing or already finished.
    Stopped(String),
    /// The task's logic (or delegate) reached its end. `closed` when that closed the query.
    Finished { closed: bool },
}

/// Outcome of storing one page: checkpoint, buffered results and follow-up in one step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordedPage {
    pub task: TaskDescription,
    /// Results buffered by this call; 0 when the page had been recorded before.
    pub appended: usize,
    pub follow_up: FollowUp,
}

/// A page handed to a consumer, plus parked continuations the drained buffer released.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TakenPage {
    pub page: Option<ResultsPage>,
    pub resumed: Vec<TaskDescription>,
}

/// Helper to get the current system time in milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
