//! Task Queue Module
//!
//! Delivers published tasks to executors with lease-based exclusive claims.
//!
//! ## Guarantees
//! - **Exclusivity**: at most one active claim per task. A claim not acknowledged or
//!   released before its lease lapses is handed out again (at-least-once delivery).
//! - **Ordering**: per query, CREATE before NEXT before CLOSE (see `pool`).
//!
//! ## Submodules
//! - **`pool`**: the synchronous lane/lease bookkeeping both backends share.
//! - **`local`**: single-process backend.
//! - **`distributed`**: partitioned by query id across the cluster, claims served by
//!   each partition's primary.

pub mod backend;
pub mod distributed;
pub mod handlers;
pub mod local;
pub mod pool;
pub mod protocol;
pub mod types;

pub use backend::{QueueBackend, QueueStats};
pub use distributed::DistributedQueue;
pub use local::LocalQueue;

#[cfg(test)]
mod tests;
