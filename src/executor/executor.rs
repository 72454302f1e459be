//! Worker Pool Implementation
//!
//! Spawns workers that claim tasks from the queue backend, run the query logic for
//! them and record the outcome in the storage cache.
//!
//! ## Responsibilities
//! - **Claiming**: bounded `claim` calls, so shutdown is noticed between claims.
//! - **Lease Management**: a sidecar renews the claim while the logic runs.
//! - **Outcomes**: checkpoint and continue, pause, finish, or fail the query. A page is
//!   recorded together with its follow-up, so a consumer never sees a query's last page
//!   before the query is closed, and a retried record never buffers a page twice.
//!
//! Nothing about a task is kept in memory between claims: whatever a worker needs is
//! read back from the storage cache, so any worker can pick up any task.

use super::composite;
use crate::config::Config;
use crate::error::{QueryStorageError, Result};
use crate::logic::registry::QueryLogicRegistry;
use crate::logic::types::{ExecutionRequest, LogicOutput, Resume};
use crate::queue::backend::QueueBackend;
use crate::queue::types::{Claim, QueuedTask};
use crate::retry::{RetryPolicy, with_backoff};
use crate::storage::cache::StorageCache;
use crate::storage::types::*;

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// What a worker did with one claimed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// A page was produced and a NEXT task published.
    Continued,
    /// A page was produced; its NEXT task waits for the consumer to catch up.
    Paused,
    /// The logic (or the delegate) reached its end.
    Finished,
    /// The logic failed; the query is FAILED.
    Failed,
    /// The CLOSE task ran.
    Closed,
    /// Nothing to run: the task or its query is already finished, or gone.
    Skipped,
    /// Processing hit a storage or queue error; the claim was given back.
    Released,
}

/// The engine that drives query execution.
pub struct QueryExecutor {
    storage: Arc<dyn StorageCache>,
    queue: Arc<dyn QueueBackend>,
    registry: Arc<QueryLogicRegistry>,
    worker_count: usize,
    page_size: usize,
    lease_renewal: Duration,
    claim_timeout: Duration,
    retry: RetryPolicy,
    max_results: u64,
    max_buffered_pages: usize,
}

impl QueryExecutor {
    pub fn new(
        storage: Arc<dyn StorageCache>,
        queue: Arc<dyn QueueBackend>,
        registry: Arc<QueryLogicRegistry>,
        config: &Config,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage,
            queue,
            registry,
            worker_count: config.executor.worker_count.max(1),
            page_size: config.executor.page_size,
            lease_renewal: Duration::from_millis(config.executor.lease_renewal_ms),
            claim_timeout: Duration::from_millis(config.queue.claim_timeout_ms),
            retry: RetryPolicy::from_config(&config.executor),
            max_results: config.executor.max_results,
            max_buffered_pages: config.executor.max_buffered_pages,
        })
    }

    /// Spawns the workers and returns their handles. Workers stop once `shutdown`
    /// turns true.
    pub fn start(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        tracing::info!("Starting {} query workers", self.worker_count);

        (0..self.worker_count)
            .map(|worker_id| {
                let executor = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    executor.worker_loop(worker_id, shutdown).await;
                })
            })
            .collect()
    }

    async fn worker_loop(&self, worker_id: usize, shutdown: watch::Receiver<bool>) {
        tracing::info!("Worker {} started", worker_id);

        while !*shutdown.borrow() {
            match self.run_once().await {
                Ok(Some((key, outcome))) => {
                    tracing::debug!("Worker {} handled task {}: {:?}", worker_id, key, outcome);
                }
                Ok(None) => {
                    tracing::trace!("Worker {} found no claimable task", worker_id);
                }
                Err(e) => {
                    tracing::warn!("Worker {} failed to claim: {}", worker_id, e);
                    tokio::time::sleep(self.claim_timeout).await;
                }
            }
        }

        tracing::info!("Worker {} stopped", worker_id);
    }

    /// Claims one task, waiting up to the claim timeout, and processes it.
    pub async fn run_once(&self) -> Result<Option<(TaskKey, TaskOutcome)>> {
        let Some(claim) = self.queue.claim(self.claim_timeout).await? else {
            return Ok(None);
        };
        let key = claim.task.key.clone();
        tracing::debug!(
            "Claimed {:?} task {} (delegate: {:?})",
            claim.task.kind,
            key,
            claim.task.delegate
        );

        match self.process(&claim).await {
            Ok(outcome) => {
                self.acknowledge(&claim).await;
                Ok(Some((key, outcome)))
            }
            Err(e) => {
                tracing::error!("Failed to process task {}: {}", key, e);
                if let Err(e) = self.queue.release(&claim).await {
                    tracing::warn!("Failed to release task {}: {}", key, e);
                }
                Ok(Some((key, TaskOutcome::Released)))
            }
        }
    }

    async fn acknowledge(&self, claim: &Claim) {
        let queue = &self.queue;
        match with_backoff(&self.retry, "acknowledge", move || queue.acknowledge(claim)).await {
            Ok(()) => {}
            Err(QueryStorageError::ClaimExpired(_)) => {
                // The task will be handed out again and skipped as already finished.
                tracing::warn!("Lease on task {} lapsed before acknowledgement", claim.task.key);
            }
            Err(e) => {
                tracing::error!("Failed to acknowledge task {}: {}", claim.task.key, e);
            }
        }
    }

    async fn process(&self, claim: &Claim) -> Result<TaskOutcome> {
        let key = &claim.task.key;
        let storage = &self.storage;

        let task = match with_backoff(&self.retry, "load task", move || storage.get_task(key)).await
        {
            Ok(task) => task,
            Err(QueryStorageError::NotFound(_)) => {
                tracing::debug!("Task {} no longer exists, dropping it", key);
                return Ok(TaskOutcome::Skipped);
            }
            Err(e) => return Err(e),
        };
        if task.state == TaskState::Completed && task.kind != TaskKind::Close {
            return self.requeue_recorded(&task).await;
        }
        if task.state.is_terminal() {
            tracing::debug!("Task {} is already {:?}, skipping", key, task.state);
            return Ok(TaskOutcome::Skipped);
        }

        let query_id = &key.query_id;
        let query = with_backoff(&self.retry, "load query", move || storage.get_query(query_id))
            .await?;

        if task.kind == TaskKind::Close {
            return self.close_query(&query, key).await;
        }
        if query.status.is_terminal() {
            tracing::debug!(
                "Query {} is {:?}, completing task {} without running it",
                query_id,
                query.status,
                key
            );
            self.set_task_state(key, TaskState::Completed).await?;
            return Ok(TaskOutcome::Skipped);
        }
        if query.status == QueryStatus::Defined {
            match with_backoff(&self.retry, "start query", move || {
                storage.update_query_status(query_id, QueryStatus::Running, None)
            })
            .await
            {
                Ok(_) => tracing::info!("Query {} is running", query_id),
                Err(QueryStorageError::InvalidTransition(_)) => {
                    self.set_task_state(key, TaskState::Completed).await?;
                    return Ok(TaskOutcome::Skipped);
                }
                Err(e) => return Err(e),
            }
        }

        self.set_task_state(key, TaskState::Running).await?;

        let logic = match self.registry.resolve(&query.query_logic).and_then(|binding| {
            composite::task_logic(&self.registry, &binding, task.delegate.as_deref())
        }) {
            Ok(logic) => logic,
            Err(e) => return self.fail(&query, &task, anyhow::Error::new(e)).await,
        };

        let request = ExecutionRequest {
            query_id: query_id.clone(),
            task: key.clone(),
            delegate: task.delegate.clone(),
            checkpoint: task.checkpoint.clone(),
            page_size: self.page_size,
            parameters: query.parameters.clone(),
        };

        let started = Instant::now();
        let renewal_handle = self.spawn_lease_renewal(claim);
        let result = logic.execute(request).await;
        renewal_handle.abort();
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(output) => self.record_output(&query, &task, output, elapsed_ms).await,
            Err(e) => self.fail(&query, &task, e).await,
        }
    }

    /// Stores the checkpoint and page together with the follow-up (continuation or end
    /// of the logic) in one storage step, then queues the continuation if there is one.
    async fn record_output(
        &self,
        query: &QueryState,
        task: &TaskDescription,
        output: LogicOutput,
        elapsed_ms: u64,
    ) -> Result<TaskOutcome> {
        let key = &task.key;
        let query_id = &key.query_id;
        let storage = &self.storage;

        let metrics = task
            .checkpoint
            .as_ref()
            .map(|c| c.metrics)
            .unwrap_or_default()
            .advance(output.page.len(), elapsed_ms);
        let (position, finished) = match output.next {
            Resume::Continue(position) => (position, false),
            Resume::Done => (serde_json::Value::Null, true),
        };
        let checkpoint = Checkpoint::new(key.clone(), task.delegate.clone(), position, metrics);
        let results = output.page.into_results();
        let limits = self.page_limits(query);

        let recorded = with_backoff(&self.retry, "record page", move || {
            storage.record_page(key, checkpoint.clone(), results.clone(), finished, limits)
        })
        .await?;

        match recorded.follow_up {
            FollowUp::Continue(next) => {
                let outcome = self.queue_continuation(&next).await?;
                tracing::debug!("Task {} continues as {}", key, next.key);
                Ok(outcome)
            }
            FollowUp::Parked(next) => {
                tracing::debug!(
                    "Task {} continues as {} once buffered results are taken",
                    key,
                    next.key
                );
                Ok(TaskOutcome::Paused)
            }
            FollowUp::Stopped(reason) => {
                tracing::debug!("No continuation for task {}: {}", key, reason);
                Ok(TaskOutcome::Continued)
            }
            FollowUp::Finished { closed } => {
                match &task.delegate {
                    Some(delegate) => {
                        tracing::info!("Delegate {} of query {} complete", delegate, query_id)
                    }
                    None => tracing::info!("Query {} complete", query_id),
                }
                if closed && task.delegate.is_some() {
                    tracing::info!("Query {} complete: every delegate finished", query_id);
                }
                Ok(TaskOutcome::Finished)
            }
        }
    }

    /// Queues a continuation. If that fails it is parked, and the consumer's next poll
    /// queues it instead.
    async fn queue_continuation(&self, next: &TaskDescription) -> Result<TaskOutcome> {
        let queue = &self.queue;
        let storage = &self.storage;
        let queued = QueuedTask::from(next);
        let published = with_backoff(&self.retry, "publish continuation", move || {
            queue.publish(queued.clone())
        })
        .await;
        let Err(e) = published else {
            return Ok(TaskOutcome::Continued);
        };

        tracing::warn!("Failed to queue continuation {}: {}", next.key, e);
        let query_id = &next.key.query_id;
        let parked = vec![next.key.task_id];
        with_backoff(&self.retry, "park continuation", move || {
            storage.park_tasks(query_id, parked.clone())
        })
        .await?;
        Ok(TaskOutcome::Paused)
    }

    /// A redelivered task whose page is already stored. Its continuation is queued
    /// again if it never ran, which covers a worker that stopped between recording the
    /// page and queueing the continuation.
    async fn requeue_recorded(&self, task: &TaskDescription) -> Result<TaskOutcome> {
        let key = &task.key;
        let storage = &self.storage;
        let Some(checkpoint) = task.checkpoint.clone() else {
            tracing::debug!("Task {} is already Completed, skipping", key);
            return Ok(TaskOutcome::Skipped);
        };

        let recorded = match with_backoff(&self.retry, "replay page", move || {
            storage.record_page(key, checkpoint.clone(), Vec::new(), false, PageLimits::default())
        })
        .await
        {
            Ok(recorded) => recorded,
            Err(QueryStorageError::InvalidTransition(_)) => {
                tracing::debug!("Task {} is already Completed, skipping", key);
                return Ok(TaskOutcome::Skipped);
            }
            Err(e) => return Err(e),
        };

        if let FollowUp::Continue(next) = recorded.follow_up {
            let next_key = &next.key;
            let current =
                with_backoff(&self.retry, "load continuation", move || storage.get_task(next_key))
                    .await?;
            if current.state == TaskState::Ready {
                tracing::info!("Queueing continuation {} of redelivered task {}", next.key, key);
                self.queue_continuation(&current).await?;
            }
        }
        Ok(TaskOutcome::Skipped)
    }

    fn page_limits(&self, query: &QueryState) -> PageLimits {
        let max_results = query
            .parameters
            .get("max_results")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(self.max_results);
        PageLimits {
            max_results,
            max_buffered_pages: self.max_buffered_pages,
        }
    }

    /// Fails the task and its query. For a composite, the other delegates' READY tasks
    /// fail too, so nothing new starts for the query.
    async fn fail(
        &self,
        query: &QueryState,
        task: &TaskDescription,
        error: anyhow::Error,
    ) -> Result<TaskOutcome> {
        let query_id = &query.query_id;
        let storage = &self.storage;
        let cause = composite::failure_cause(task.delegate.as_deref(), &error);
        tracing::warn!("Task {} failed: {}", task.key, cause);

        self.set_task_state(&task.key, TaskState::Failed).await?;

        let recorded = cause.clone();
        match with_backoff(&self.retry, "fail query", move || {
            storage.update_query_status(query_id, QueryStatus::Failed, Some(recorded.clone()))
        })
        .await
        {
            Ok(_) => tracing::info!("Query {} failed: {}", query_id, cause),
            Err(QueryStorageError::InvalidTransition(reason)) => {
                tracing::debug!("Query {} already finished: {}", query_id, reason)
            }
            Err(e) => return Err(e),
        }

        if query.is_composite() {
            let failed = with_backoff(&self.retry, "fail pending tasks", move || {
                storage.fail_pending_tasks(query_id, None)
            })
            .await?;
            tracing::debug!("Failed {} pending tasks of query {}", failed, query_id);
        }
        Ok(TaskOutcome::Failed)
    }

    /// Runs the close hooks of the query's logic (every delegate's, for a composite).
    async fn close_query(&self, query: &QueryState, key: &TaskKey) -> Result<TaskOutcome> {
        let query_id = &query.query_id;
        match self.registry.resolve(&query.query_logic) {
            Ok(binding) => {
                for (delegate, logic) in composite::close_targets(&self.registry, &binding) {
                    if let Err(e) = logic.close(query_id).await {
                        tracing::warn!(
                            "Close hook of {} failed for query {}: {:#}",
                            delegate.as_deref().unwrap_or(&query.query_logic),
                            query_id,
                            e
                        );
                    }
                }
            }
            Err(e) => tracing::warn!("Cannot run close hooks for query {}: {}", query_id, e),
        }

        self.set_task_state(key, TaskState::Completed).await?;
        tracing::info!("Query {} closed", query_id);
        Ok(TaskOutcome::Closed)
    }

    async fn set_task_state(&self, key: &TaskKey, state: TaskState) -> Result<()> {
        let storage = &self.storage;
        with_backoff(&self.retry, "update task state", move || {
            storage.update_task_state(key, state)
        })
        .await?;
        Ok(())
    }

    /// Spawns a sidecar that renews the claim's lease while the logic runs.
    ///
    /// If the worker hangs past the lease, renewal stops with it and the task is
    /// handed to another worker.
    fn spawn_lease_renewal(&self, claim: &Claim) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let claim = claim.clone();
        let period = self.lease_renewal;

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;

                match queue.renew(&claim).await {
                    Ok(expires_at) => {
                        tracing::trace!(
                            "Renewed lease for task {} until {}",
                            claim.task.key,
                            expires_at
                        );
                    }
                    Err(e) => {
                        tracing::warn!("Lost lease on task {}: {}", claim.task.key, e);
                        break;
                    }
                }
            }
        })
    }
}
