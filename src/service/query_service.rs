//! Query Service
//!
//! The write and read paths callers use: submit a query, page through its results,
//! close or cancel it, and inspect what is running.

use crate::config::ServiceConfig;
use crate::error::{QueryStorageError, Result};
use crate::executor::composite;
use crate::logic::registry::{LogicBinding, QueryLogicRegistry};
use crate::queue::backend::QueueBackend;
use crate::queue::types::QueuedTask;
use crate::storage::cache::StorageCache;
use crate::storage::types::*;

use std::sync::Arc;
use std::time::Duration;

pub struct QueryService {
    storage: Arc<dyn StorageCache>,
    queue: Arc<dyn QueueBackend>,
    registry: Arc<QueryLogicRegistry>,
    config: ServiceConfig,
}

impl QueryService {
    pub fn new(
        storage: Arc<dyn StorageCache>,
        queue: Arc<dyn QueueBackend>,
        registry: Arc<QueryLogicRegistry>,
        config: ServiceConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage,
            queue,
            registry,
            config,
        })
    }

    /// Records the query with its initial tasks (one per delegate for a composite) and
    /// queues them. Fails with `NotFound` for an unregistered query logic.
    pub async fn create_query(
        &self,
        query_logic: &str,
        query_pool: &str,
        parameters: serde_json::Value,
    ) -> Result<QueryState> {
        let binding = self.registry.resolve(query_logic)?;
        let fan_out = composite::plan(&binding, self.config.merge_policy);

        let state = self
            .storage
            .create_query(NewQuery {
                query_id: QueryId::new(),
                query_logic: query_logic.to_string(),
                query_pool: query_pool.to_string(),
                parameters,
                delegates: fan_out.delegates,
                initial_tasks: fan_out.initial_tasks,
            })
            .await?;
        let query_id = &state.query_id;

        for task in self.storage.get_tasks(query_id).await? {
            if let Err(e) = self.queue.publish(QueuedTask::from(&task)).await {
                tracing::error!("Failed to queue task {}: {}", task.key, e);
                self.storage
                    .update_query_status(
                        query_id,
                        QueryStatus::Failed,
                        Some(format!("submission failed: {}", e)),
                    )
                    .await?;
                self.storage.fail_pending_tasks(query_id, None).await?;
                self.queue.revoke_query(query_id).await?;
                return Err(e);
            }
        }

        tracing::info!(
            "Created query {} ({}, {} initial tasks)",
            query_id,
            query_logic,
            state.task_ids.len()
        );
        Ok(state)
    }

    /// Waits up to `next_timeout_ms` for the next page of results.
    ///
    /// - FAILED / CANCELED: COMPLETE with no results.
    /// - A buffered page: PARTIAL, or COMPLETE when it is the last one of a closed query.
    /// - CLOSED with nothing buffered: COMPLETE with no results.
    /// - Nothing produced in time: NONE.
    pub async fn next(&self, query_id: &QueryId) -> Result<ResultsPage> {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(self.config.next_timeout_ms);
        let poll = Duration::from_millis(self.config.next_poll_ms.max(1));

        loop {
            let state = self.storage.touch_query(query_id, now_ms()).await?;
            if matches!(state.status, QueryStatus::Failed | QueryStatus::Canceled) {
                return Ok(ResultsPage::complete(Vec::new()));
            }
            let taken = self
                .storage
                .take_results(query_id, self.merge_policy(&state))
                .await?;
            self.resume_parked(query_id, taken.resumed).await;
            if let Some(page) = taken.page {
                tracing::trace!("Query {} handed out {} results", query_id, page.len());
                return Ok(page);
            }
            if state.status == QueryStatus::Closed {
                return Ok(ResultsPage::complete(Vec::new()));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(ResultsPage::none());
            }
            tokio::time::sleep((deadline - now).min(poll)).await;
        }
    }

    /// Stops the query from producing more work and queues its CLOSE task, which runs the
    /// logic's close hook once work already queued has drained. Closing a finished query
    /// returns it unchanged.
    ///
    /// The query is CLOSED before the CLOSE task is queued. If queueing fails the task is
    /// marked FAILED and the error returned; the query stays CLOSED and its close hook
    /// does not run.
    pub async fn close(&self, query_id: &QueryId) -> Result<QueryState> {
        let state = self.storage.get_query(query_id).await?;
        if state.status.is_terminal() {
            return Ok(state);
        }

        let (close, state) = match self.storage.close_query(query_id).await {
            Ok(closing) => closing,
            // Finished in the meantime.
            Err(QueryStorageError::InvalidTransition(_)) => {
                return self.storage.get_query(query_id).await;
            }
            Err(e) => return Err(e),
        };

        if let Err(e) = self.queue.publish(QueuedTask::from(&close)).await {
            tracing::error!("Failed to queue CLOSE task {}: {}", close.key, e);
            if let Err(mark) = self
                .storage
                .update_task_state(&close.key, TaskState::Failed)
                .await
            {
                tracing::warn!("Failed to mark CLOSE task {} failed: {}", close.key, mark);
            }
            return Err(e);
        }
        tracing::info!("Query {} closing", query_id);
        Ok(state)
    }

    /// Cancels the query: pending tasks fail and queued or claimed work is revoked.
    /// Canceling a finished query returns it unchanged.
    pub async fn cancel(&self, query_id: &QueryId) -> Result<QueryState> {
        let state = self.storage.get_query(query_id).await?;
        if state.status.is_terminal() {
            return Ok(state);
        }

        let state = self
            .storage
            .update_query_status(
                query_id,
                QueryStatus::Canceled,
                Some("canceled by user".to_string()),
            )
            .await?;
        let failed = self.storage.fail_pending_tasks(query_id, None).await?;
        let released = self.queue.revoke_query(query_id).await?;
        tracing::info!(
            "Query {} canceled ({} tasks failed, {} claims released)",
            query_id,
            failed,
            released
        );
        Ok(state)
    }

    pub async fn get_running_queries(&self) -> Result<Vec<QueryState>> {
        self.storage.list_running_queries().await
    }

    pub async fn list_queries(&self) -> Result<Vec<QueryState>> {
        self.storage.list_queries().await
    }

    pub async fn get_query(&self, query_id: &QueryId) -> Result<QueryState> {
        self.storage.get_query(query_id).await
    }

    pub async fn get_tasks(&self, query_id: &QueryId) -> Result<Vec<TaskDescription>> {
        self.storage.get_tasks(query_id).await
    }

    pub fn registry(&self) -> &Arc<QueryLogicRegistry> {
        &self.registry
    }

    /// Queues continuations a drained buffer released. One that cannot be queued is
    /// parked again for the next call.
    async fn resume_parked(&self, query_id: &QueryId, tasks: Vec<TaskDescription>) {
        let mut parked = Vec::new();
        for task in tasks {
            match self.queue.publish(QueuedTask::from(&task)).await {
                Ok(()) => tracing::debug!("Resumed parked task {}", task.key),
                Err(e) => {
                    tracing::warn!("Failed to queue parked task {}: {}", task.key, e);
                    parked.push(task.key.task_id);
                }
            }
        }
        if parked.is_empty() {
            return;
        }
        if let Err(e) = self.storage.park_tasks(query_id, parked).await {
            tracing::error!("Failed to park tasks of query {} again: {}", query_id, e);
        }
    }

    fn merge_policy(&self, state: &QueryState) -> MergePolicy {
        match self.registry.resolve(&state.query_logic) {
            Ok(LogicBinding::Composite(definition)) => definition.merge,
            _ => self.config.merge_policy,
        }
    }
}
