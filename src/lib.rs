//! Query Task Storage Library
//!
//! The coordination layer of a distributed query service: it stores query and task
//! state, hands tasks to executors through a lease-based queue, runs query logics page
//! by page and cleans up queries nobody polls anymore. The binary (`main.rs`) wires the
//! pieces into a node.
//!
//! ## Modules
//! - **`storage`**: query records, task checkpoints and buffered results, in-process
//!   (`SyncStorageCache`) or partitioned across the cluster (`DistributedStorageCache`).
//! - **`queue`**: task delivery with exclusive, renewable claims and CREATE/NEXT/CLOSE
//!   ordering per query.
//! - **`logic`**: the `QueryLogic` contract and the registry of named and composite logics.
//! - **`executor`**: workers that claim tasks, run the logic and record its output.
//! - **`monitor`**: periodic sweep canceling abandoned queries and deleting finished ones.
//! - **`service`**: submission, paging, close and cancel, plus read-only HTTP views.
//! - **`cluster`**: gossip membership, partition ownership and the peer HTTP client.
//! - **`backend`**: picks the storage/queue pair from configuration.

pub mod backend;
pub mod cluster;
pub mod config;
pub mod error;
pub mod executor;
pub mod logic;
pub mod monitor;
pub mod queue;
pub mod retry;
pub mod service;
pub mod storage;

#[cfg(test)]
mod testing;
