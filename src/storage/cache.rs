//! Storage Cache Contract
//!
//! Backends implement four primitives (`execute`, `load`, `load_all`, `clear`); the
//! rest of the API is provided on top of them so every backend exposes the same
//! behavior for the same calls.

use super::record::{OpOutcome, QueryRecord, StorageOp};
use super::types::*;
use crate::error::{QueryStorageError, Result};

use async_trait::async_trait;
use std::collections::BTreeMap;

#[async_trait]
pub trait StorageCache: Send + Sync {
    /// Applies one mutation atomically for the query it names.
    async fn execute(&self, op: StorageOp) -> Result<OpOutcome>;

    /// Returns a snapshot of one query's record.
    async fn load(&self, query_id: &QueryId) -> Result<Option<QueryRecord>>;

    /// Returns a snapshot of every record. Each record is internally consistent;
    /// the set as a whole is not linearizable across queries.
    async fn load_all(&self) -> Result<Vec<QueryRecord>>;

    /// Records this node is responsible for maintaining. Every record for a single-node
    /// backend; only partition-primary records for a distributed one.
    async fn load_owned(&self) -> Result<Vec<QueryRecord>> {
        self.load_all().await
    }

    /// Drops every query and task.
    async fn clear(&self) -> Result<usize>;

    async fn create_query(&self, query: NewQuery) -> Result<QueryState> {
        expect_state(self.execute(StorageOp::Create(query)).await?)
    }

    async fn get_query(&self, query_id: &QueryId) -> Result<QueryState> {
        Ok(self.require(query_id).await?.state)
    }

    async fn list_queries(&self) -> Result<Vec<QueryState>> {
        let mut states: Vec<QueryState> =
            self.load_all().await?.into_iter().map(|r| r.state).collect();
        states.sort_by_key(|s| s.created_at);
        Ok(states)
    }

    /// Queries that are DEFINED or RUNNING.
    async fn list_running_queries(&self) -> Result<Vec<QueryState>> {
        Ok(self
            .list_queries()
            .await?
            .into_iter()
            .filter(|s| !s.status.is_terminal())
            .collect())
    }

    async fn get_tasks(&self, query_id: &QueryId) -> Result<Vec<TaskDescription>> {
        Ok(self.require(query_id).await?.describe_tasks())
    }

    async fn get_task(&self, key: &TaskKey) -> Result<TaskDescription> {
        let record = self.require(&key.query_id).await?;
        Ok(record.task(key.task_id)?.describe())
    }

    /// Full checkpoint history of a task, oldest first.
    async fn get_checkpoints(&self, key: &TaskKey) -> Result<Vec<Checkpoint>> {
        let record = self.require(&key.query_id).await?;
        Ok(record.task(key.task_id)?.history.clone())
    }

    async fn task_counts(&self, query_id: &QueryId) -> Result<BTreeMap<TaskKind, usize>> {
        let mut counts = BTreeMap::from([
            (TaskKind::Create, 0),
            (TaskKind::Next, 0),
            (TaskKind::Close, 0),
        ]);
        for task in self.get_tasks(query_id).await? {
            *counts.entry(task.kind).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn add_task(&self, query_id: &QueryId, spec: TaskSpec) -> Result<TaskDescription> {
        expect_task(
            self.execute(StorageOp::AddTask {
                query_id: query_id.clone(),
                spec,
            })
            .await?,
        )
    }

    /// Appends `checkpoint` to the task's history and moves it to `next_state`
    /// (READY or COMPLETED) in one step.
    async fn update_checkpoint(
        &self,
        key: &TaskKey,
        checkpoint: Checkpoint,
        next_state: TaskState,
    ) -> Result<TaskDescription> {
        expect_task(
            self.execute(StorageOp::UpdateCheckpoint {
                key: key.clone(),
                checkpoint,
                next_state,
            })
            .await?,
        )
    }

    async fn update_task_state(&self, key: &TaskKey, state: TaskState) -> Result<TaskDescription> {
        expect_task(
            self.execute(StorageOp::UpdateTaskState {
                key: key.clone(),
                state,
            })
            .await?,
        )
    }

    async fn update_query_status(
        &self,
        query_id: &QueryId,
        status: QueryStatus,
        cause: Option<String>,
    ) -> Result<QueryState> {
        expect_state(
            self.execute(StorageOp::UpdateStatus {
                query_id: query_id.clone(),
                status,
                cause,
            })
            .await?,
        )
    }

    /// Marks a composite delegate complete. Returns true when that closed the query.
    async fn complete_delegate(&self, query_id: &QueryId, delegate: &str) -> Result<bool> {
        match self
            .execute(StorageOp::CompleteDelegate {
                query_id: query_id.clone(),
                delegate: delegate.to_string(),
            })
            .await?
        {
            OpOutcome::Flag(closed) => Ok(closed),
            other => Err(unexpected("flag", &other)),
        }
    }

    async fn touch_query(&self, query_id: &QueryId, at: u64) -> Result<QueryState> {
        expect_state(
            self.execute(StorageOp::Touch {
                query_id: query_id.clone(),
                at,
            })
            .await?,
        )
    }

    async fn append_results(
        &self,
        query_id: &QueryId,
        lane: Option<String>,
        results: Vec<serde_json::Value>,
    ) -> Result<usize> {
        expect_count(
            self.execute(StorageOp::AppendResults {
                query_id: query_id.clone(),
                lane,
                results,
            })
            .await?,
        )
    }

    async fn take_results(&self, query_id: &QueryId, merge: MergePolicy) -> Result<TakenPage> {
        match self
            .execute(StorageOp::TakeResults {
                query_id: query_id.clone(),
                merge,
            })
            .await?
        {
            OpOutcome::Taken(taken) => Ok(taken),
            other => Err(unexpected("page", &other)),
        }
    }

    /// Records an executed task's checkpoint and page, and queues up its continuation
    /// or finishes it, as one atomic step. Safe to repeat.
    async fn record_page(
        &self,
        key: &TaskKey,
        checkpoint: Checkpoint,
        results: Vec<serde_json::Value>,
        finished: bool,
        limits: PageLimits,
    ) -> Result<RecordedPage> {
        match self
            .execute(StorageOp::RecordPage {
                key: key.clone(),
                checkpoint,
                results,
                finished,
                limits,
            })
            .await?
        {
            OpOutcome::Recorded(recorded) => Ok(recorded),
            other => Err(unexpected("recorded page", &other)),
        }
    }

    /// Adds the CLOSE task and moves the query to CLOSED in one step.
    async fn close_query(&self, query_id: &QueryId) -> Result<(TaskDescription, QueryState)> {
        match self
            .execute(StorageOp::Close {
                query_id: query_id.clone(),
            })
            .await?
        {
            OpOutcome::Closing { task, state } => Ok((task, state)),
            other => Err(unexpected("closing", &other)),
        }
    }

    /// Holds READY tasks back until the next `take_results` releases them.
    async fn park_tasks(&self, query_id: &QueryId, task_ids: Vec<u64>) -> Result<usize> {
        expect_count(
            self.execute(StorageOp::Park {
                query_id: query_id.clone(),
                task_ids,
            })
            .await?,
        )
    }

    /// Fails READY tasks, and RUNNING tasks idle for `stale_running_ms` when given.
    async fn fail_pending_tasks(
        &self,
        query_id: &QueryId,
        stale_running_ms: Option<u64>,
    ) -> Result<usize> {
        expect_count(
            self.execute(StorageOp::FailPendingTasks {
                query_id: query_id.clone(),
                stale_running_ms,
            })
            .await?,
        )
    }

    /// Deletes the query with all its tasks, checkpoints and buffered results.
    /// Returns the number of tasks removed; deleting an unknown query is not an error.
    async fn delete_query(&self, query_id: &QueryId) -> Result<usize> {
        expect_count(
            self.execute(StorageOp::Delete {
                query_id: query_id.clone(),
            })
            .await?,
        )
    }

    async fn require(&self, query_id: &QueryId) -> Result<QueryRecord> {
        self.load(query_id)
            .await?
            .ok_or_else(|| QueryStorageError::NotFound(format!("query {}", query_id)))
    }
}

fn expect_state(outcome: OpOutcome) -> Result<QueryState> {
    match outcome {
        OpOutcome::State(state) => Ok(state),
        other => Err(unexpected("query state", &other)),
    }
}

fn expect_task(outcome: OpOutcome) -> Result<TaskDescription> {
    match outcome {
        OpOutcome::Task(task) => Ok(task),
        other => Err(unexpected("task", &other)),
    }
}

fn expect_count(outcome: OpOutcome) -> Result<usize> {
    match outcome {
        OpOutcome::Count(count) => Ok(count),
        other => Err(unexpected("count", &other)),
    }
}

fn unexpected(wanted: &str, got: &OpOutcome) -> QueryStorageError {
    QueryStorageError::InvalidTransition(format!("expected {} outcome, got {:?}", wanted, got))
}
