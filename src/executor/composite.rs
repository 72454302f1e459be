//! Composite Coordination
//!
//! A composite query fans out into one CREATE task per delegate. Each task carries
//! its delegate name, every checkpoint it writes carries the same tag, and its results
//! are buffered in the delegate's own lane. The query closes once every delegate is
//! complete; one failing delegate fails the whole query.

use crate::error::{QueryStorageError, Result};
use crate::logic::registry::{LogicBinding, QueryLogicRegistry};
use crate::logic::types::QueryLogic;
use crate::storage::types::{MergePolicy, TaskSpec};

use std::sync::Arc;

/// How a query is laid out in storage at submission.
#[derive(Debug, Clone, PartialEq)]
pub struct FanOut {
    pub delegates: Vec<String>,
    pub initial_tasks: Vec<TaskSpec>,
    pub merge: MergePolicy,
}

pub fn plan(binding: &LogicBinding, default_merge: MergePolicy) -> FanOut {
    match binding {
        LogicBinding::Plain(_) => FanOut {
            delegates: Vec::new(),
            initial_tasks: vec![TaskSpec::create(None)],
            merge: default_merge,
        },
        LogicBinding::Composite(definition) => FanOut {
            delegates: definition.delegates.clone(),
            initial_tasks: definition
                .delegates
                .iter()
                .map(|d| TaskSpec::create(Some(d.clone())))
                .collect(),
            merge: definition.merge,
        },
    }
}

/// The logic that runs a task: the delegate's for a tagged task, the query's own otherwise.
pub fn task_logic(
    registry: &QueryLogicRegistry,
    binding: &LogicBinding,
    delegate: Option<&str>,
) -> Result<Arc<dyn QueryLogic>> {
    match (binding, delegate) {
        (LogicBinding::Plain(logic), None) => Ok(logic.clone()),
        (LogicBinding::Composite(definition), Some(delegate)) => {
            if !definition.delegates.iter().any(|d| d == delegate) {
                return Err(QueryStorageError::NotFound(format!(
                    "delegate {} of composite {}",
                    delegate, definition.name
                )));
            }
            registry.logic(delegate)
        }
        (LogicBinding::Plain(_), Some(delegate)) => Err(QueryStorageError::InvalidTransition(
            format!("task tagged with delegate {} on a plain query", delegate),
        )),
        (LogicBinding::Composite(definition), None) => {
            Err(QueryStorageError::InvalidTransition(format!(
                "untagged task on composite {}",
                definition.name
            )))
        }
    }
}

/// Every logic whose close hook runs for the query's CLOSE task.
pub fn close_targets(
    registry: &QueryLogicRegistry,
    binding: &LogicBinding,
) -> Vec<(Option<String>, Arc<dyn QueryLogic>)> {
    match binding {
        LogicBinding::Plain(logic) => vec![(None, logic.clone())],
        LogicBinding::Composite(definition) => definition
            .delegates
            .iter()
            .filter_map(|d| registry.logic(d).ok().map(|logic| (Some(d.clone()), logic)))
            .collect(),
    }
}

/// Cause recorded on a query failed by one of its tasks.
pub fn failure_cause(delegate: Option<&str>, error: &anyhow::Error) -> String {
    match delegate {
        Some(delegate) => format!("delegate {} failed: {:#}", delegate, error),
        None => format!("{:#}", error),
    }
}
