use crate::{events::EventEmitter, events::RunId, NodeError, NodeId, Value};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

/// Core trait that all executable nodes implement
#[async_trait]
pub trait Node: Send + Sync {
    /// Unique type identifier (e.g., "http.request", "transform.json_parse")
    fn node_type(&self) -> &str;

    /// Execute the node with given context
    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError>;
}

/// Execution context passed to each node attempt
#[derive(Clone)]
pub struct NodeContext {
    pub run_id: RunId,

    pub node_id: NodeId,

    /// 1-based attempt number, bumped by the retry controller
    pub attempt: u32,

    /// Input values bound from upstream ports (or the run payload for roots)
    pub inputs: HashMap<String, Value>,

    /// Static configuration for this node
    pub config: HashMap<String, Value>,

    /// Snapshot of run variables published by completed nodes
    pub variables: HashMap<String, Value>,

    /// Event emitter for real-time updates
    pub events: EventEmitter,

    /// Run-scoped cancellation signal
    pub cancellation: CancellationToken,
}

impl NodeContext {
    pub fn new(run_id: RunId, node_id: impl Into<NodeId>, events: EventEmitter) -> Self {
        Self {
            run_id,
            node_id: node_id.into(),
            attempt: 1,
            inputs: HashMap::new(),
            config: HashMap::new(),
            variables: HashMap::new(),
            events,
            cancellation: CancellationToken::new(),
        }
    }

    /// Get required input or return error
    pub fn require_input(&self, name: &str) -> Result<&Value, NodeError> {
        self.inputs.get(name)
            .ok_or_else(|| NodeError::MissingInput(name.to_string()))
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }
}

/// Output from node execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeOutput {
    /// Output port values
    pub outputs: HashMap<String, Value>,

    /// Variables to publish into the run context on completion
    #[serde(default)]
    pub variables: HashMap<String, Value>,

    /// Execution metadata
    #[serde(default)]
    pub metadata: NodeMetadata,
}

impl NodeOutput {
    pub fn new() -> Self {
        Self {
            outputs: HashMap::new(),
            variables: HashMap::new(),
            metadata: NodeMetadata::default(),
        }
    }

    pub fn with_output(mut self, port: impl Into<String>, value: impl Into<Value>) -> Self {
        self.outputs.insert(port.into(), value.into());
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }
}

impl Default for NodeOutput {
    fn default() -> Self {
        Self::new()
    }
}

/// Metadata about node execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMetadata {
    pub execution_time_ms: u64,
    pub attempts: u32,
    pub isolated: bool,
}
