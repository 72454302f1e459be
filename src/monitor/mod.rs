//! Query Monitor Module
//!
//! Reclaims what abandoned and finished queries hold: cancels queries whose consumer
//! stopped polling, fails work left behind by dead workers, and deletes finished
//! queries after a grace period. Sweeps are idempotent and never overlap.

pub mod monitor;

pub use monitor::{QueryMonitor, SweepReport};

#[cfg(test)]
mod tests;
