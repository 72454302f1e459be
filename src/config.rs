//! Node Configuration
//!
//! All tunables for a node live in one [`Config`] value, loaded once at startup
//! (from a TOML file when `--config` is given, otherwise the defaults) and passed
//! explicitly to every component that needs it.

use crate::error::{QueryStorageError, Result};
use crate::storage::types::MergePolicy;

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Which storage cache / queue backend pair a node runs with.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// Single process, one lock domain. Low-scale deployments and tests.
    #[default]
    Synchronous,
    /// Partitioned across the cluster by query id, replicated to backups.
    Distributed,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub log_level: LogLevel,
    pub storage: StorageConfig,
    pub queue: QueueConfig,
    pub executor: ExecutorConfig,
    pub monitor: MonitorConfig,
    pub service: ServiceConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Number of partitions query ids are hashed into (distributed backend).
    pub partitions: u32,
    /// Owners per partition, primary included.
    pub replication_factor: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Synchronous,
            partitions: 256,
            replication_factor: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// How long a claim stays exclusive without being renewed.
    pub lease_ms: u64,
    /// Upper bound on a single blocking `claim`.
    pub claim_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_ms: 30_000,
            claim_timeout_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub worker_count: usize,
    /// Page size handed to query logics.
    pub page_size: usize,
    /// Lease renewal period; should stay well under `queue.lease_ms`.
    pub lease_renewal_ms: u64,
    pub retry_attempts: usize,
    pub retry_initial_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
    /// Results a query may produce before it is finished; 0 for no limit. A query's
    /// `max_results` parameter takes precedence.
    pub max_results: u64,
    /// Pages buffered for a consumer before continuations wait for it; 0 for no limit.
    pub max_buffered_pages: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            page_size: 100,
            lease_renewal_ms: 10_000,
            retry_attempts: 3,
            retry_initial_backoff_ms: 150,
            retry_max_backoff_ms: 1_200,
            max_results: 0,
            max_buffered_pages: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub sweep_interval_ms: u64,
    /// A running query not refreshed for this long is canceled.
    pub query_timeout_ms: u64,
    /// How long a finished query stays queryable before it is deleted.
    pub grace_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 30_000,
            query_timeout_ms: 15 * 60 * 1_000,
            grace_ms: 5 * 60 * 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// How long `next` waits for a page before answering NONE.
    pub next_timeout_ms: u64,
    pub next_poll_ms: u64,
    pub merge_policy: MergePolicy,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            next_timeout_ms: 60_000,
            next_poll_ms: 50,
            merge_policy: MergePolicy::RoundRobin,
        }
    }
}

impl Config {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(raw).map_err(|e| QueryStorageError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            QueryStorageError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage.partitions == 0 {
            return Err(QueryStorageError::Config(
                "storage.partitions must be positive".to_string(),
            ));
        }
        if self.storage.replication_factor == 0 {
            return Err(QueryStorageError::Config(
                "storage.replication_factor must be positive".to_string(),
            ));
        }
        if self.executor.worker_count == 0 {
            return Err(QueryStorageError::Config(
                "executor.worker_count must be positive".to_string(),
            ));
        }
        if self.executor.lease_renewal_ms >= self.queue.lease_ms {
            return Err(QueryStorageError::Config(format!(
                "executor.lease_renewal_ms ({}) must be below queue.lease_ms ({})",
                self.executor.lease_renewal_ms, self.queue.lease_ms
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.storage.backend, StorageBackend::Synchronous);
        assert_eq!(config.service.merge_policy, MergePolicy::RoundRobin);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
            log_level = "debug"

            [storage]
            backend = "distributed"
            partitions = 64

            [monitor]
            query_timeout_ms = 2000
            "#,
        )
        .expect("config should parse");

        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.storage.backend, StorageBackend::Distributed);
        assert_eq!(config.storage.partitions, 64);
        assert_eq!(config.storage.replication_factor, 2);
        assert_eq!(config.monitor.query_timeout_ms, 2000);
        assert_eq!(config.queue.lease_ms, 30_000);
    }

    #[test]
    fn test_renewal_must_be_shorter_than_lease() {
        let result = Config::from_toml_str(
            r#"
            [queue]
            lease_ms = 1000

            [executor]
            lease_renewal_ms = 1000
            "#,
        );
        assert!(matches!(result, Err(QueryStorageError::Config(_))));
    }

    #[test]
    fn test_unknown_backend_is_rejected() {
        let result = Config::from_toml_str("[storage]\nbackend = \"zookeeper\"\n");
        assert!(result.is_err());
    }
}
