//! Query Record State Machine
//!
//! A [`QueryRecord`] is everything the storage cache keeps for one query: its
//! [`QueryState`], every task with its append-only checkpoint history, and the
//! buffer of produced result pages. Both storage backends keep whole records and
//! mutate them only through [`QueryRecord::apply`], so the transition rules are
//! written once and the two backends cannot drift apart.

use super::types::*;
use crate::error::{QueryStorageError, Result};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// A task together with its full checkpoint history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRecord {
    pub key: TaskKey,
    pub kind: TaskKind,
    pub state: TaskState,
    pub delegate: Option<String>,
    /// Append-only. The last entry is authoritative.
    pub history: Vec<Checkpoint>,
    pub created_at: u64,
    pub last_updated_at: u64,
    /// Set once the task's page is recorded; a repeated record returns it unchanged.
    #[serde(default)]
    pub recorded: Option<FollowUp>,
}

impl TaskRecord {
    pub fn describe(&self) -> TaskDescription {
        TaskDescription {
            key: self.key.clone(),
            kind: self.kind,
            state: self.state,
            delegate: self.delegate.clone(),
            checkpoint: self.history.last().cloned(),
            checkpoint_count: self.history.len(),
            created_at: self.created_at,
            last_updated_at: self.last_updated_at,
        }
    }

    fn transition(&mut self, next: TaskState, now: u64) -> Result<()> {
        if self.state == next {
            self.last_updated_at = now;
            return Ok(());
        }
        if self.state.is_terminal() {
            return Err(QueryStorageError::InvalidTransition(format!(
                "task {} is already {:?}",
                self.key, self.state
            )));
        }
        self.state = next;
        self.last_updated_at = now;
        Ok(())
    }
}

/// One atomic mutation of a single query.
///
/// Serializable so the distributed backend can forward it to the partition primary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StorageOp {
    Create(NewQuery),
    AddTask {
        query_id: QueryId,
        spec: TaskSpec,
    },
    UpdateCheckpoint {
        key: TaskKey,
        checkpoint: Checkpoint,
        next_state: TaskState,
    },
    UpdateTaskState {
        key: TaskKey,
        state: TaskState,
    },
    UpdateStatus {
        query_id: QueryId,
        status: QueryStatus,
        cause: Option<String>,
    },
    CompleteDelegate {
        query_id: QueryId,
        delegate: String,
    },
    Touch {
        query_id: QueryId,
        at: u64,
    },
    AppendResults {
        query_id: QueryId,
        lane: Option<String>,
        results: Vec<serde_json::Value>,
    },
    /// Checkpoint, results and follow-up of one executed task.
    RecordPage {
        key: TaskKey,
        checkpoint: Checkpoint,
        results: Vec<serde_json::Value>,
        finished: bool,
        limits: PageLimits,
    },
    /// Adds the CLOSE task and moves the query to CLOSED.
    Close {
        query_id: QueryId,
    },
    /// Parks READY continuations until the next take releases them.
    Park {
        query_id: QueryId,
        task_ids: Vec<u64>,
    },
    TakeResults {
        query_id: QueryId,
        merge: MergePolicy,
    },
    FailPendingTasks {
        query_id: QueryId,
        /// Only RUNNING tasks untouched for this long are failed; READY tasks always are.
        stale_running_ms: Option<u64>,
    },
    Delete {
        query_id: QueryId,
    },
}

impl StorageOp {
    pub fn query_id(&self) -> &QueryId {
        match self {
            StorageOp::Create(new) => &new.query_id,
            StorageOp::AddTask { query_id, .. }
            | StorageOp::UpdateStatus { query_id, .. }
            | StorageOp::CompleteDelegate { query_id, .. }
            | StorageOp::Touch { query_id, .. }
            | StorageOp::AppendResults { query_id, .. }
            | StorageOp::Close { query_id }
            | StorageOp::Park { query_id, .. }
            | StorageOp::TakeResults { query_id, .. }
            | StorageOp::FailPendingTasks { query_id, .. }
            | StorageOp::Delete { query_id } => query_id,
            StorageOp::UpdateCheckpoint { key, .. }
            | StorageOp::UpdateTaskState { key, .. }
            | StorageOp::RecordPage { key, .. } => &key.query_id,
        }
    }
}

/// What an applied [`StorageOp`] produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OpOutcome {
    State(QueryState),
    Task(TaskDescription),
    Taken(TakenPage),
    Recorded(RecordedPage),
    Closing {
        task: TaskDescription,
        state: QueryState,
    },
    Count(usize),
    Flag(bool),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryRecord {
    pub state: QueryState,
    pub tasks: BTreeMap<u64, TaskRecord>,
    next_task_id: u64,
    results: VecDeque<BufferedPage>,
    /// Lane served by the last round-robin take.
    last_served: Option<Option<String>>,
    /// READY continuations held back until the buffer drains below `resume_below`.
    parked: Vec<u64>,
    resume_below: usize,
}

impl QueryRecord {
    pub fn new(new: NewQuery, now: u64) -> Self {
        let mut record = Self {
            state: QueryState {
                query_id: new.query_id,
                query_logic: new.query_logic,
                query_pool: new.query_pool,
                parameters: new.parameters,
                status: QueryStatus::Defined,
                task_ids: Vec::new(),
                delegates: new
                    .delegates
                    .into_iter()
                    .map(|name| DelegateState {
                        name,
                        complete: false,
                    })
                    .collect(),
                failure: None,
                num_results: 0,
                created_at: now,
                last_checked_at: now,
            },
            tasks: BTreeMap::new(),
            next_task_id: 0,
            results: VecDeque::new(),
            last_served: None,
            parked: Vec::new(),
            resume_below: 0,
        };
        for spec in new.initial_tasks {
            record.insert_task(spec, now);
        }
        record
    }

    pub fn query_id(&self) -> &QueryId {
        &self.state.query_id
    }

    pub fn describe_tasks(&self) -> Vec<TaskDescription> {
        self.tasks.values().map(TaskRecord::describe).collect()
    }

    pub fn task(&self, task_id: u64) -> Result<&TaskRecord> {
        self.tasks.get(&task_id).ok_or_else(|| {
            QueryStorageError::NotFound(format!("task {}:{}", self.state.query_id, task_id))
        })
    }

    fn task_mut(&mut self, task_id: u64) -> Result<&mut TaskRecord> {
        let query_id = self.state.query_id.clone();
        self.tasks
            .get_mut(&task_id)
            .ok_or_else(|| QueryStorageError::NotFound(format!("task {}:{}", query_id, task_id)))
    }

    pub fn all_tasks_terminal(&self) -> bool {
        self.tasks.values().all(|t| t.state.is_terminal())
    }

    pub fn buffered_pages(&self) -> usize {
        self.results.len()
    }

    pub fn parked_tasks(&self) -> &[u64] {
        &self.parked
    }

    /// Applies a mutation. `Create` and `Delete` act on the map holding the record and are
    /// handled by the backends; passing them here is an error.
    pub fn apply(&mut self, op: StorageOp, now: u64) -> Result<OpOutcome> {
        match op {
            StorageOp::AddTask { spec, .. } => self.add_task(spec, now).map(OpOutcome::Task),
            StorageOp::UpdateCheckpoint {
                key,
                checkpoint,
                next_state,
            } => self
                .update_checkpoint(&key, checkpoint, next_state, now)
                .map(OpOutcome::Task),
            StorageOp::UpdateTaskState { key, state } => {
                let task = self.task_mut(key.task_id)?;
                task.transition(state, now)?;
                let description = task.describe();
                self.state.last_checked_at = now;
                Ok(OpOutcome::Task(description))
            }
            StorageOp::UpdateStatus { status, cause, .. } => {
                self.update_status(status, cause, now)?;
                Ok(OpOutcome::State(self.state.clone()))
            }
            StorageOp::CompleteDelegate { delegate, .. } => {
                self.complete_delegate(&delegate, now).map(OpOutcome::Flag)
            }
            StorageOp::Touch { at, .. } => {
                self.state.last_checked_at = at;
                Ok(OpOutcome::State(self.state.clone()))
            }
            StorageOp::AppendResults { lane, results, .. } => {
                let appended = results.len();
                if !results.is_empty() {
                    self.state.num_results += appended as u64;
                    self.results.push_back(BufferedPage { lane, results });
                }
                Ok(OpOutcome::Count(appended))
            }
            StorageOp::RecordPage {
                key,
                checkpoint,
                results,
                finished,
                limits,
            } => self
                .record_page(&key, checkpoint, results, finished, limits, now)
                .map(OpOutcome::Recorded),
            StorageOp::Close { .. } => {
                let task = self.close(now)?;
                Ok(OpOutcome::Closing {
                    task,
                    state: self.state.clone(),
                })
            }
            StorageOp::Park { task_ids, .. } => Ok(OpOutcome::Count(self.park(task_ids))),
            StorageOp::TakeResults { merge, .. } => Ok(OpOutcome::Taken(self.take_results(merge))),
            StorageOp::FailPendingTasks {
                stale_running_ms, ..
            } => Ok(OpOutcome::Count(self.fail_pending_tasks(stale_running_ms, now))),
            StorageOp::Create(_) | StorageOp::Delete { .. } => Err(
                QueryStorageError::InvalidTransition("create/delete act on the store".to_string()),
            ),
        }
    }

    fn insert_task(&mut self, spec: TaskSpec, now: u64) -> TaskDescription {
        let key = TaskKey::new(self.state.query_id.clone(), self.next_task_id);
        self.next_task_id += 1;

        let history = spec
            .resume
            .map(|checkpoint| vec![checkpoint.rebind(key.clone())])
            .unwrap_or_default();

        let task = TaskRecord {
            key: key.clone(),
            kind: spec.kind,
            state: TaskState::Ready,
            delegate: spec.delegate,
            history,
            created_at: now,
            last_updated_at: now,
            recorded: None,
        };
        let description = task.describe();
        self.state.task_ids.push(key.task_id);
        self.tasks.insert(key.task_id, task);
        self.state.last_checked_at = now;
        description
    }

    /// Continuations are refused once the query is terminal or a CLOSE task exists:
    /// this is what stops a canceled or failed query from spawning more work.
    fn add_task(&mut self, spec: TaskSpec, now: u64) -> Result<TaskDescription> {
        let query_id = &self.state.query_id;
        if self.state.status.is_terminal() {
            return Err(QueryStorageError::InvalidTransition(format!(
                "query {} is {:?}, no new tasks accepted",
                query_id, self.state.status
            )));
        }
        if self.tasks.values().any(|t| t.kind == TaskKind::Close) {
            return Err(QueryStorageError::InvalidTransition(format!(
                "query {} is closing, no new tasks accepted",
                query_id
            )));
        }
        if let Some(delegate) = &spec.delegate
            && !self.state.delegates.iter().any(|d| &d.name == delegate)
        {
            return Err(QueryStorageError::NotFound(format!(
                "delegate {} of query {}",
                delegate, query_id
            )));
        }
        if spec.kind == TaskKind::Close {
            self.complete_parked(now);
        }
        Ok(self.insert_task(spec, now))
    }

    /// Stores a task's page in one step: the checkpoint, the results, and either the
    /// continuation or the end of the task's logic. Recording the same task again
    /// returns the first outcome without buffering anything.
    fn record_page(
        &mut self,
        key: &TaskKey,
        mut checkpoint: Checkpoint,
        mut results: Vec<serde_json::Value>,
        mut finished: bool,
        limits: PageLimits,
        now: u64,
    ) -> Result<RecordedPage> {
        if &checkpoint.task != key {
            return Err(QueryStorageError::InvalidTransition(format!(
                "checkpoint for {} does not match task {}",
                checkpoint.task, key
            )));
        }
        let task = self.task(key.task_id)?;
        if let Some(follow_up) = &task.recorded {
            return Ok(RecordedPage {
                task: task.describe(),
                appended: 0,
                follow_up: follow_up.clone(),
            });
        }
        if task.state.is_terminal() {
            return Err(QueryStorageError::InvalidTransition(format!(
                "task {} is already {:?}",
                key, task.state
            )));
        }
        let delegate = task.delegate.clone();
        if let Some(name) = &delegate
            && !self.state.delegates.iter().any(|d| &d.name == name)
        {
            return Err(QueryStorageError::NotFound(format!(
                "delegate {} of query {}",
                name, self.state.query_id
            )));
        }

        if limits.max_results > 0 {
            let remaining = limits.max_results.saturating_sub(self.state.num_results) as usize;
            if results.len() >= remaining {
                let dropped = (results.len() - remaining) as u64;
                results.truncate(remaining);
                checkpoint.metrics.results = checkpoint.metrics.results.saturating_sub(dropped);
                checkpoint.resume_position = serde_json::Value::Null;
                finished = true;
            }
        }

        let task = self.task_mut(key.task_id)?;
        task.transition(TaskState::Completed, now)?;
        task.history.push(checkpoint.clone());

        let appended = results.len();
        if appended > 0 {
            self.state.num_results += appended as u64;
            self.results.push_back(BufferedPage {
                lane: delegate.clone(),
                results,
            });
        }

        let follow_up = if finished {
            self.finish(delegate.as_deref(), now)
        } else {
            self.continue_with(checkpoint, limits, now)
        };

        let task = self.task_mut(key.task_id)?;
        task.recorded = Some(follow_up.clone());
        let description = task.describe();
        self.state.last_checked_at = now;
        Ok(RecordedPage {
            task: description,
            appended,
            follow_up,
        })
    }

    fn finish(&mut self, delegate: Option<&str>, now: u64) -> FollowUp {
        let closed = match delegate {
            Some(name) => self.complete_delegate(name, now).unwrap_or(false),
            None => {
                !self.state.status.is_terminal()
                    && self.update_status(QueryStatus::Closed, None, now).is_ok()
            }
        };
        FollowUp::Finished { closed }
    }

    fn continue_with(&mut self, checkpoint: Checkpoint, limits: PageLimits, now: u64) -> FollowUp {
        match self.add_task(TaskSpec::next(checkpoint), now) {
            Ok(next) => {
                if limits.max_buffered_pages > 0 && self.results.len() >= limits.max_buffered_pages {
                    self.parked.push(next.key.task_id);
                    self.resume_below = limits.max_buffered_pages;
                    FollowUp::Parked(next)
                } else {
                    FollowUp::Continue(next)
                }
            }
            Err(e) => FollowUp::Stopped(e.to_string()),
        }
    }

    fn close(&mut self, now: u64) -> Result<TaskDescription> {
        if self.state.status.is_terminal() {
            return Err(QueryStorageError::InvalidTransition(format!(
                "query {} is {:?}, it cannot be closed",
                self.state.query_id, self.state.status
            )));
        }
        let task = self.add_task(TaskSpec::close(), now)?;
        self.update_status(QueryStatus::Closed, None, now)?;
        Ok(task)
    }

    /// Parks READY tasks. Returns how many were added.
    fn park(&mut self, task_ids: Vec<u64>) -> usize {
        let mut parked = 0;
        for task_id in task_ids {
            let ready = self
                .tasks
                .get(&task_id)
                .is_some_and(|t| t.state == TaskState::Ready);
            if ready && !self.parked.contains(&task_id) {
                self.parked.push(task_id);
                parked += 1;
            }
        }
        parked
    }

    /// A closing query produces nothing more, so its parked continuations are done.
    fn complete_parked(&mut self, now: u64) {
        for task_id in std::mem::take(&mut self.parked) {
            if let Some(task) = self.tasks.get_mut(&task_id)
                && task.state == TaskState::Ready
            {
                task.state = TaskState::Completed;
                task.last_updated_at = now;
            }
        }
    }

    fn release_parked(&mut self) -> Vec<TaskDescription> {
        if self.parked.is_empty() || self.results.len() >= self.resume_below.max(1) {
            return Vec::new();
        }
        std::mem::take(&mut self.parked)
            .into_iter()
            .filter_map(|task_id| self.tasks.get(&task_id))
            .filter(|task| task.state == TaskState::Ready)
            .map(TaskRecord::describe)
            .collect()
    }

    fn update_checkpoint(
        &mut self,
        key: &TaskKey,
        checkpoint: Checkpoint,
        next_state: TaskState,
        now: u64,
    ) -> Result<TaskDescription> {
        if &checkpoint.task != key {
            return Err(QueryStorageError::InvalidTransition(format!(
                "checkpoint for {} does not match task {}",
                checkpoint.task, key
            )));
        }
        if !matches!(next_state, TaskState::Ready | TaskState::Completed) {
            return Err(QueryStorageError::InvalidTransition(format!(
                "a checkpoint moves a task to Ready or Completed, not {:?}",
                next_state
            )));
        }
        let task = self.task_mut(key.task_id)?;
        task.transition(next_state, now)?;
        task.history.push(checkpoint);
        let description = task.describe();
        self.state.last_checked_at = now;
        Ok(description)
    }

    fn update_status(&mut self, status: QueryStatus, cause: Option<String>, now: u64) -> Result<()> {
        let current = self.state.status;
        if !current.can_transition_to(status) {
            return Err(QueryStorageError::InvalidTransition(format!(
                "query {} cannot move from {:?} to {:?}",
                self.state.query_id, current, status
            )));
        }
        if current != status {
            self.state.status = status;
            if cause.is_some() {
                self.state.failure = cause;
            }
        }
        self.state.last_checked_at = now;
        Ok(())
    }

    /// Marks a delegate complete and closes the query once every delegate is.
    fn complete_delegate(&mut self, delegate: &str, now: u64) -> Result<bool> {
        let query_id = self.state.query_id.clone();
        let entry = self
            .state
            .delegates
            .iter_mut()
            .find(|d| d.name == delegate)
            .ok_or_else(|| {
                QueryStorageError::NotFound(format!("delegate {} of query {}", delegate, query_id))
            })?;
        entry.complete = true;
        self.state.last_checked_at = now;

        let all_complete = self.state.delegates.iter().all(|d| d.complete);
        if all_complete && !self.state.status.is_terminal() {
            self.update_status(QueryStatus::Closed, None, now)?;
        }
        Ok(all_complete && self.state.status == QueryStatus::Closed)
    }

    fn fail_pending_tasks(&mut self, stale_running_ms: Option<u64>, now: u64) -> usize {
        self.parked.clear();
        let mut failed = 0;
        for task in self.tasks.values_mut() {
            let stale_running = task.state == TaskState::Running
                && stale_running_ms
                    .is_some_and(|limit| now.saturating_sub(task.last_updated_at) >= limit);
            if task.state == TaskState::Ready || stale_running {
                task.state = TaskState::Failed;
                task.last_updated_at = now;
                failed += 1;
            }
        }
        failed
    }

    /// Removes the next page to hand to a consumer. The returned page is COMPLETE only
    /// when nothing else is buffered and the query is CLOSED. Parked continuations are
    /// released once the buffer is below the level that parked them.
    fn take_results(&mut self, merge: MergePolicy) -> TakenPage {
        let index = match merge {
            MergePolicy::Fifo => 0,
            MergePolicy::RoundRobin => self.next_round_robin_index(),
        };
        let page = self.results.remove(index).map(|page| {
            self.last_served = Some(page.lane.clone());
            let finished = self.results.is_empty() && self.state.status == QueryStatus::Closed;
            if finished {
                ResultsPage::complete(page.results)
            } else {
                ResultsPage::partial(page.results)
            }
        });
        TakenPage {
            page,
            resumed: self.release_parked(),
        }
    }

    fn next_round_robin_index(&self) -> usize {
        let lanes: Vec<Option<String>> = if self.state.delegates.is_empty() {
            vec![None]
        } else {
            self.state
                .delegates
                .iter()
                .map(|d| Some(d.name.clone()))
                .collect()
        };

        let start = self
            .last_served
            .as_ref()
            .and_then(|served| lanes.iter().position(|lane| lane == served))
            .map(|pos| pos + 1)
            .unwrap_or(0);

        (0..lanes.len())
            .map(|offset| &lanes[(start + offset) % lanes.len()])
            .find_map(|lane| self.results.iter().position(|page| &page.lane == lane))
            .unwrap_or(0)
    }
}
