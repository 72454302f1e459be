//! Cluster Module
//!
//! What the distributed backends need to spread queries over several nodes:
//!
//! - **`membership`**: UDP gossip (SWIM-like) for discovery and failure detection.
//! - **`partitioner`**: hashes query ids into partitions and picks a primary plus backups
//!   for each partition from the alive members.
//! - **`peer`**: HTTP client used to forward operations to a partition's primary and to
//!   replicate state to its backups.

pub mod membership;
pub mod partitioner;
pub mod peer;
pub mod types;

#[cfg(test)]
mod tests;
