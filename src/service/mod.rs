//! Query Service Module
//!
//! Entry points for consumers of the subsystem: submission, result paging, close and
//! cancel, plus a read-only HTTP view of queries and their tasks.

pub mod handlers;
pub mod query_service;

pub use query_service::QueryService;
