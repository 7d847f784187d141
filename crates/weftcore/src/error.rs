use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::events::RunId;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Run not found: {0}")]
    RunNotFound(RunId),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Coarse classification of a node failure, recorded in `NodeResult::Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    TransientIo,
    Timeout,
    IsolationFault,
    Fatal,
    Cancelled,
}

impl ErrorKind {
    /// Kinds the retry controller may re-attempt. `IsolationFault` is only
    /// retried when the node's policy opts in.
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorKind::TransientIo | ErrorKind::Timeout)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::TransientIo => "transient_io",
            ErrorKind::Timeout => "timeout",
            ErrorKind::IsolationFault => "isolation_fault",
            ErrorKind::Fatal => "fatal",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Errors raised by node logic. Serializable so they can cross the
/// isolation boundary unchanged.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "error", content = "detail", rename_all = "snake_case")]
pub enum NodeError {
    #[error("Missing required input: {0}")]
    MissingInput(String),

    #[error("Invalid input type for '{field}': expected {expected}, got {actual}")]
    InvalidInputType {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Transient I/O failure: {0}")]
    TransientIo(String),

    #[error("Timeout after {millis}ms")]
    Timeout { millis: u64 },

    #[error("Isolation fault: {0}")]
    IsolationFault(String),

    #[error("Cancelled")]
    Cancelled,
}

impl NodeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NodeError::MissingInput(_)
            | NodeError::InvalidInputType { .. }
            | NodeError::Configuration(_) => ErrorKind::Validation,
            NodeError::ExecutionFailed(_) => ErrorKind::Fatal,
            NodeError::TransientIo(_) => ErrorKind::TransientIo,
            NodeError::Timeout { .. } => ErrorKind::Timeout,
            NodeError::IsolationFault(_) => ErrorKind::IsolationFault,
            NodeError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkflowError {
    #[error("Workflow not found: {0}")]
    NotFound(String),

    #[error("Invalid workflow: {0}")]
    Invalid(String),

    #[error("Cyclic dependency detected at node '{node}'")]
    CyclicDependency { node: String },

    #[error("Duplicate node id: {0}")]
    DuplicateNode(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Invalid connection: {0}")]
    InvalidConnection(String),
}

/// Configuration and registry errors. Always raised before a node runs.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Unknown node type: {0}")]
    UnknownType(String),

    #[error("Node type already registered: {0}")]
    DuplicateType(String),

    #[error("{node_type}: missing required field '{field}'")]
    MissingField { node_type: String, field: String },

    #[error("{node_type}: field '{field}' expected {expected}, got {actual}")]
    WrongType {
        node_type: String,
        field: String,
        expected: String,
        actual: String,
    },

    #[error("{node_type}: field '{field}' has value '{value}', allowed: {allowed:?}")]
    NotAllowed {
        node_type: String,
        field: String,
        value: String,
        allowed: Vec<String>,
    },

    #[error("{node_type}: {message}")]
    Rejected { node_type: String, message: String },
}

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Checkpoint storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Checkpoint encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_error_kinds() {
        assert_eq!(NodeError::MissingInput("x".into()).kind(), ErrorKind::Validation);
        assert_eq!(NodeError::ExecutionFailed("x".into()).kind(), ErrorKind::Fatal);
        assert_eq!(NodeError::Timeout { millis: 5 }.kind(), ErrorKind::Timeout);
        assert_eq!(NodeError::IsolationFault("x".into()).kind(), ErrorKind::IsolationFault);
        assert_eq!(NodeError::Cancelled.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn only_timeout_and_transient_io_are_transient() {
        assert!(ErrorKind::Timeout.is_transient());
        assert!(ErrorKind::TransientIo.is_transient());
        assert!(!ErrorKind::IsolationFault.is_transient());
        assert!(!ErrorKind::Validation.is_transient());
        assert!(!ErrorKind::Fatal.is_transient());
        assert!(!ErrorKind::Cancelled.is_transient());
    }

    #[test]
    fn node_error_survives_json() {
        let err = NodeError::InvalidInputType {
            field: "url".into(),
            expected: "string".into(),
            actual: "number".into(),
        };
        let json = serde_json::to_string(&err).unwrap();
        let back: NodeError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
    }
}
