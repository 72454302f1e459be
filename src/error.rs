//! Error taxonomy shared by the storage cache, queue backends and coordinators.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by the task storage subsystem.
///
/// - [`QueryStorageError::NotFound`]: unknown query or task, returned to the caller as-is.
/// - [`QueryStorageError::ClaimExpired`]: the lease on a claim lapsed (or was revoked) before
///   the holder acknowledged or released it.
/// - [`QueryStorageError::ExecutionFailure`]: the query logic failed; terminal for the query.
/// - [`QueryStorageError::BackendUnavailable`]: a storage or queue peer could not be reached.
///   The only variant worth retrying.
#[derive(Debug, Error)]
pub enum QueryStorageError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("claim expired for task {0}")]
    ClaimExpired(String),

    #[error("query {query_id} failed: {cause}")]
    ExecutionFailure { query_id: String, cause: String },

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A status or task transition that would break monotonicity, or a publish that would
    /// break per-query ordering (e.g. a second CLOSE).
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl QueryStorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, QueryStorageError::BackendUnavailable(_))
    }
}

impl From<reqwest::Error> for QueryStorageError {
    fn from(e: reqwest::Error) -> Self {
        QueryStorageError::BackendUnavailable(e.to_string())
    }
}

/// Error category carried across node boundaries, so a forwarded operation fails on
/// the caller with the same variant it failed with on the owner.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    ClaimExpired,
    ExecutionFailure,
    BackendUnavailable,
    InvalidTransition,
    Config,
    Serialization,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub kind: ErrorKind,
    pub message: String,
}

impl QueryStorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueryStorageError::NotFound(_) => ErrorKind::NotFound,
            QueryStorageError::ClaimExpired(_) => ErrorKind::ClaimExpired,
            QueryStorageError::ExecutionFailure { .. } => ErrorKind::ExecutionFailure,
            QueryStorageError::BackendUnavailable(_) => ErrorKind::BackendUnavailable,
            QueryStorageError::InvalidTransition(_) => ErrorKind::InvalidTransition,
            QueryStorageError::Config(_) => ErrorKind::Config,
            QueryStorageError::Serialization(_) => ErrorKind::Serialization,
        }
    }

    pub fn http_status(&self) -> u16 {
        match self.kind() {
            ErrorKind::NotFound => 404,
            ErrorKind::ClaimExpired | ErrorKind::InvalidTransition => 409,
            ErrorKind::Config | ErrorKind::Serialization => 400,
            ErrorKind::BackendUnavailable => 503,
            ErrorKind::ExecutionFailure => 500,
        }
    }

    /// Message without the variant prefix added by `Display`.
    fn detail(&self) -> String {
        match self {
            QueryStorageError::NotFound(m)
            | QueryStorageError::ClaimExpired(m)
            | QueryStorageError::BackendUnavailable(m)
            | QueryStorageError::InvalidTransition(m)
            | QueryStorageError::Config(m) => m.clone(),
            QueryStorageError::ExecutionFailure { query_id, cause } => {
                format!("{}\u{1f}{}", query_id, cause)
            }
            QueryStorageError::Serialization(e) => e.to_string(),
        }
    }
}

impl From<&QueryStorageError> for WireError {
    fn from(e: &QueryStorageError) -> Self {
        WireError {
            kind: e.kind(),
            message: e.detail(),
        }
    }
}

impl From<WireError> for QueryStorageError {
    fn from(e: WireError) -> Self {
        match e.kind {
            ErrorKind::NotFound => QueryStorageError::NotFound(e.message),
            ErrorKind::ClaimExpired => QueryStorageError::ClaimExpired(e.message),
            ErrorKind::ExecutionFailure => {
                let (query_id, cause) = e
                    .message
                    .split_once('\u{1f}')
                    .map(|(q, c)| (q.to_string(), c.to_string()))
                    .unwrap_or_else(|| (String::new(), e.message.clone()));
                QueryStorageError::ExecutionFailure { query_id, cause }
            }
            ErrorKind::BackendUnavailable => QueryStorageError::BackendUnavailable(e.message),
            ErrorKind::InvalidTransition => QueryStorageError::InvalidTransition(e.message),
            ErrorKind::Config => QueryStorageError::Config(e.message),
            // The source error cannot be rebuilt on this side.
            ErrorKind::Serialization => QueryStorageError::InvalidTransition(format!(
                "remote serialization error: {}",
                e.message
            )),
        }
    }
}

pub type Result<T> = std::result::Result<T, QueryStorageError>;
