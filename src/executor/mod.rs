//! Query Executor Module
//!
//! Turns queued tasks into results. The executor follows a **pull-based** model with
//! **lease** management:
//! 1. **Claim**: a worker claims the next task the queue backend releases for it.
//! 2. **Run**: the task's query logic runs from the task's latest checkpoint while a
//!    sidecar renews the lease.
//! 3. **Record**: the new checkpoint and page go to the storage cache; a continuation
//!    is published if the logic has more to produce.
//! 4. **Acknowledge**: the claim is acknowledged and the task leaves the queue. A worker
//!    that dies before this point loses its lease and the task is handed out again.
//!
//! ## Submodules
//! - **`executor`**: the worker pool and the claim -> run -> record -> ack lifecycle.
//! - **`composite`**: fan-out and failure rules for composite queries.

pub mod composite;
pub mod executor;

pub use executor::{QueryExecutor, TaskOutcome};
