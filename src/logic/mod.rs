//! Query Logic Module
//!
//! Query logics produce the results of a query one page at a time and describe
//! where to resume with an opaque position. The executor never interprets that
//! position; it only stores it in a checkpoint and hands it back.
//!
//! ## Submodules
//! - **`types`**: the `QueryLogic` trait and its request/output types.
//! - **`registry`**: maps query logic names to implementations and composite definitions.
//! - **`builtin`**: logics shipped with the node.

pub mod builtin;
pub mod registry;
pub mod types;

pub use builtin::SequenceLogic;
pub use registry::{LogicBinding, QueryLogicRegistry};
pub use types::{CompositeDefinition, ExecutionRequest, LogicOutput, QueryLogic, Resume};
