//! Core abstractions for the weft workflow engine
//!
//! This crate provides the fundamental types and traits that all other
//! components depend on: workflow definitions, the node contract, node
//! results, the error taxonomy and execution events. It has no runtime
//! behaviour of its own.

mod error;
pub mod events;
mod node;
mod result;
mod value;
mod workflow;

pub use error::{CheckpointError, ErrorKind, FlowError, NodeError, ValidationError, WorkflowError};
pub use events::*;
pub use node::{Node, NodeContext, NodeMetadata, NodeOutput};
pub use result::{NodeResult, RunState};
pub use value::Value;
pub use workflow::{
    Connection, ErrorMode, NodeId, NodeOptions, NodeSpec, RetryPolicy, WorkflowDefinition,
    WorkflowId, WorkflowSettings,
};

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
