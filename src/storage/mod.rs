//! Query Storage Module
//!
//! Holds every query's state, its tasks with their checkpoint histories, and the
//! results produced for it but not yet handed to a consumer.
//!
//! ## Core Concepts
//! - **Records**: `QueryRecord` owns all data for one query and is the only place the
//!   transition rules live (append-only checkpoints, monotonic status).
//! - **Contract**: `StorageCache` is the API callers use; backends implement four
//!   primitives and inherit the rest.
//! - **Backends**: `SyncStorageCache` keeps everything behind one lock in-process;
//!   `DistributedStorageCache` partitions records by query id across the cluster,
//!   applying mutations on the primary and replicating snapshots to backups.

pub mod cache;
pub mod distributed;
pub mod handlers;
pub mod memory;
pub mod protocol;
pub mod record;
pub mod types;

pub use cache::StorageCache;
pub use distributed::DistributedStorageCache;
pub use memory::SyncStorageCache;
