//! Query Logic Registry
//!
//! Maps query logic names (e.g., "sequence") to implementations. A name resolves
//! either to a plain logic or to a composite definition whose delegates are plain
//! logics registered under their own names.

use super::types::*;
use crate::error::{QueryStorageError, Result};

use async_trait::async_trait;
use dashmap::DashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Type-erased async closure usable as a query logic.
pub type LogicFn = Arc<
    dyn Fn(ExecutionRequest) -> Pin<Box<dyn Future<Output = anyhow::Result<LogicOutput>> + Send>>
        + Send
        + Sync,
>;

struct FnLogic(LogicFn);

#[async_trait]
impl QueryLogic for FnLogic {
    async fn execute(&self, request: ExecutionRequest) -> anyhow::Result<LogicOutput> {
        (self.0)(request).await
    }
}

/// What a query logic name stands for.
#[derive(Clone)]
pub enum LogicBinding {
    Plain(Arc<dyn QueryLogic>),
    Composite(CompositeDefinition),
}

pub struct QueryLogicRegistry {
    logics: DashMap<String, Arc<dyn QueryLogic>>,
    composites: DashMap<String, CompositeDefinition>,
}

impl QueryLogicRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, name: &str, logic: Arc<dyn QueryLogic>) {
        self.composites.remove(name);
        self.logics.insert(name.to_string(), logic);
        tracing::info!("Registered query logic: {}", name);
    }

    /// Registers an async closure as a query logic.
    pub fn register_fn<F, Fut>(&self, name: &str, logic: F)
    where
        F: Fn(ExecutionRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<LogicOutput>> + Send + 'static,
    {
        // Box the future so closures with different future types share one map.
        let logic_fn: LogicFn = Arc::new(move |request: ExecutionRequest| {
            Box::pin(logic(request))
                as Pin<Box<dyn Future<Output = anyhow::Result<LogicOutput>> + Send>>
        });
        self.register(name, Arc::new(FnLogic(logic_fn)));
    }

    /// Registers a composite. Every delegate must already be registered as a plain logic.
    pub fn register_composite(&self, definition: CompositeDefinition) -> Result<()> {
        if definition.delegates.is_empty() {
            return Err(QueryStorageError::Config(format!(
                "composite {} has no delegates",
                definition.name
            )));
        }
        for (i, delegate) in definition.delegates.iter().enumerate() {
            if !self.logics.contains_key(delegate) {
                return Err(QueryStorageError::NotFound(format!(
                    "query logic {} (delegate of {})",
                    delegate, definition.name
                )));
            }
            if definition.delegates[..i].contains(delegate) {
                return Err(QueryStorageError::Config(format!(
                    "composite {} lists delegate {} twice",
                    definition.name, delegate
                )));
            }
        }

        tracing::info!(
            "Registered composite query logic: {} ({} delegates, {:?} merge)",
            definition.name,
            definition.delegates.len(),
            definition.merge
        );
        self.logics.remove(&definition.name);
        self.composites.insert(definition.name.clone(), definition);
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Result<LogicBinding> {
        if let Some(logic) = self.logics.get(name) {
            return Ok(LogicBinding::Plain(logic.value().clone()));
        }
        if let Some(definition) = self.composites.get(name) {
            return Ok(LogicBinding::Composite(definition.value().clone()));
        }
        Err(QueryStorageError::NotFound(format!("query logic {}", name)))
    }

    /// Looks up a plain logic.
    pub fn logic(&self, name: &str) -> Result<Arc<dyn QueryLogic>> {
        self.logics
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| QueryStorageError::NotFound(format!("query logic {}", name)))
    }

    /// Names of every plain and composite logic, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .logics
            .iter()
            .map(|entry| entry.key().clone())
            .chain(self.composites.iter().map(|entry| entry.key().clone()))
            .collect();
        names.sort();
        names
    }

    pub fn has(&self, name: &str) -> bool {
        self.logics.contains_key(name) || self.composites.contains_key(name)
    }

    pub fn count(&self) -> usize {
        self.logics.len() + self.composites.len()
    }
}

impl Default for QueryLogicRegistry {
    fn default() -> Self {
        Self {
            logics: DashMap::new(),
            composites: DashMap::new(),
        }
    }
}
