//! Retry with exponential backoff and jitter.
//!
//! Only [`QueryStorageError::BackendUnavailable`] is retried; every other error is
//! returned on the first attempt.

use crate::config::ExecutorConfig;
use crate::error::{QueryStorageError, Result};

use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl RetryPolicy {
    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self {
            attempts: config.retry_attempts.max(1),
            initial_backoff_ms: config.retry_initial_backoff_ms,
            max_backoff_ms: config.retry_max_backoff_ms,
        }
    }

    /// Single attempt, no waiting.
    pub fn once() -> Self {
        Self {
            attempts: 1,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ExecutorConfig::default())
    }
}

pub async fn with_backoff<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut delay_ms = policy.initial_backoff_ms;

    for attempt in 0..attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt + 1 < attempts => {
                tracing::warn!(
                    "{} failed (attempt {}/{}): {}",
                    what,
                    attempt + 1,
                    attempts,
                    e
                );
                // Simple jitter to prevent thundering herd
                let jitter = rand::random::<u64>() % 50;
                tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                delay_ms = (delay_ms * 2).min(policy.max_backoff_ms);
            }
            Err(e) => return Err(e),
        }
    }

    Err(QueryStorageError::BackendUnavailable(format!(
        "{}: retry attempts exhausted",
        what
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_policy(attempts: usize) -> RetryPolicy {
        RetryPolicy {
            attempts,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        }
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried_until_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let result = with_backoff(&fast_policy(3), "flaky op", || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(QueryStorageError::BackendUnavailable("down".to_string()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_semantic_errors_are_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let result: Result<()> = with_backoff(&fast_policy(5), "lookup", || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(QueryStorageError::NotFound("query q".to_string()))
            }
        })
        .await;

        assert!(matches!(result, Err(QueryStorageError::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_last_transient_error_is_returned() {
        let result: Result<()> = with_backoff(&fast_policy(2), "always down", || async {
            Err(QueryStorageError::BackendUnavailable("down".to_string()))
        })
        .await;

        assert!(matches!(result, Err(QueryStorageError::BackendUnavailable(_))));
    }
}
