//! Backend Selection
//!
//! Resolves the configured storage/queue strategy once at startup. Everything else
//! receives the chosen pair as trait objects and never learns which one it got.

use crate::cluster::membership::MembershipService;
use crate::cluster::partitioner::PartitionManager;
use crate::cluster::peer::PeerClient;
use crate::config::{Config, StorageBackend};
use crate::error::{QueryStorageError, Result};
use crate::queue::{self, DistributedQueue, LocalQueue, QueueBackend};
use crate::retry::RetryPolicy;
use crate::storage::{self, DistributedStorageCache, StorageCache, SyncStorageCache};

use axum::Router;
use std::sync::Arc;

struct ClusterBackends {
    membership: Arc<MembershipService>,
    partitioner: Arc<PartitionManager>,
    storage: Arc<DistributedStorageCache>,
    queue: Arc<DistributedQueue>,
}

pub struct Backends {
    pub storage: Arc<dyn StorageCache>,
    pub queue: Arc<dyn QueueBackend>,
    cluster: Option<ClusterBackends>,
}

impl Backends {
    /// `membership` is required for the distributed backend and ignored otherwise.
    pub fn from_config(config: &Config, membership: Option<Arc<MembershipService>>) -> Result<Self> {
        match config.storage.backend {
            StorageBackend::Synchronous => Ok(Self::synchronous(config)),
            StorageBackend::Distributed => {
                let membership = membership.ok_or_else(|| {
                    QueryStorageError::Config(
                        "the distributed backend needs cluster membership".to_string(),
                    )
                })?;
                Ok(Self::distributed(config, membership))
            }
        }
    }

    pub fn synchronous(config: &Config) -> Self {
        tracing::info!("Using synchronous storage and queue");
        Self {
            storage: Arc::new(SyncStorageCache::new()),
            queue: Arc::new(LocalQueue::new(config.queue.lease_ms)),
            cluster: None,
        }
    }

    pub fn distributed(config: &Config, membership: Arc<MembershipService>) -> Self {
        tracing::info!(
            "Using distributed storage and queue ({} partitions, replication factor {})",
            config.storage.partitions,
            config.storage.replication_factor
        );
        let partitioner = Arc::new(PartitionManager::new(
            membership.clone(),
            config.storage.partitions,
            config.storage.replication_factor,
        ));
        let peers = Arc::new(PeerClient::new(
            membership.clone(),
            RetryPolicy::from_config(&config.executor),
        ));
        let storage = Arc::new(DistributedStorageCache::new(
            partitioner.clone(),
            peers.clone(),
        ));
        let queue = Arc::new(DistributedQueue::new(
            partitioner.clone(),
            peers,
            config.queue.lease_ms,
        ));

        Self {
            storage: storage.clone(),
            queue: queue.clone(),
            cluster: Some(ClusterBackends {
                membership,
                partitioner,
                storage,
                queue,
            }),
        }
    }

    pub fn is_distributed(&self) -> bool {
        self.cluster.is_some()
    }

    pub fn membership(&self) -> Option<&Arc<MembershipService>> {
        self.cluster.as_ref().map(|c| &c.membership)
    }

    /// Node-to-node routes of the distributed backends; empty for the synchronous pair.
    pub fn internal_router(&self) -> Router {
        match &self.cluster {
            Some(cluster) => storage::handlers::router(cluster.storage.clone())
                .merge(queue::handlers::router(cluster.queue.clone())),
            None => Router::new(),
        }
    }

    /// One-line summary for the periodic stats log.
    pub async fn describe(&self) -> String {
        let queue = match self.queue.stats().await {
            Ok(stats) => format!("{} queued, {} claimed", stats.queued, stats.claimed),
            Err(e) => format!("queue unavailable ({})", e),
        };
        match &self.cluster {
            Some(cluster) => format!(
                "{}; primary for {} partitions, backup for {}; {} local records",
                queue,
                cluster.partitioner.my_primary_partitions().len(),
                cluster.partitioner.my_backup_partitions().len(),
                cluster.storage.local_entry_count()
            ),
            None => queue,
        }
    }
}
