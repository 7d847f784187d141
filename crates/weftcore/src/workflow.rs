use crate::{Value, WorkflowError};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

pub type WorkflowId = Uuid;
pub type NodeId = String;

/// Complete, immutable workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: WorkflowId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub settings: WorkflowSettings,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            nodes: Vec::new(),
            connections: Vec::new(),
            settings: WorkflowSettings::default(),
        }
    }

    pub fn add_node(&mut self, node: NodeSpec) -> NodeId {
        let id = node.id.clone();
        self.nodes.push(node);
        id
    }

    pub fn connect(
        &mut self,
        from_node: impl Into<NodeId>,
        from_port: impl Into<String>,
        to_node: impl Into<NodeId>,
        to_port: impl Into<String>,
    ) {
        self.connections.push(Connection {
            from_node: from_node.into(),
            from_port: from_port.into(),
            to_node: to_node.into(),
            to_port: to_port.into(),
        });
    }

    /// Builder-style variant of [`connect`](Self::connect)
    pub fn with_connection(
        mut self,
        from_node: impl Into<NodeId>,
        from_port: impl Into<String>,
        to_node: impl Into<NodeId>,
        to_port: impl Into<String>,
    ) -> Self {
        self.connect(from_node, from_port, to_node, to_port);
        self
    }

    pub fn with_node(mut self, node: NodeSpec) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn find_node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Structural checks that do not need the graph: at least one node,
    /// unique ids, and connections that point at declared nodes.
    /// Cycles are detected when the dependency graph is built.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.nodes.is_empty() {
            return Err(WorkflowError::Invalid("workflow has no nodes".to_string()));
        }

        let mut seen = HashSet::new();
        for node in &self.nodes {
            if node.id.is_empty() {
                return Err(WorkflowError::Invalid("node id must not be empty".to_string()));
            }
            if !seen.insert(node.id.as_str()) {
                return Err(WorkflowError::DuplicateNode(node.id.clone()));
            }
        }

        for conn in &self.connections {
            if !seen.contains(conn.from_node.as_str()) {
                return Err(WorkflowError::NodeNotFound(conn.from_node.clone()));
            }
            if !seen.contains(conn.to_node.as_str()) {
                return Err(WorkflowError::NodeNotFound(conn.to_node.clone()));
            }
            if conn.from_node == conn.to_node {
                return Err(WorkflowError::CyclicDependency {
                    node: conn.from_node.clone(),
                });
            }
        }

        Ok(())
    }
}

/// Node specification in a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: NodeId,
    pub node_type: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub config: HashMap<String, Value>,
    #[serde(default)]
    pub options: NodeOptions,
}

impl NodeSpec {
    pub fn new(id: impl Into<NodeId>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            name: None,
            config: HashMap::new(),
            options: NodeOptions::default(),
        }
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.options.retry = policy;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.options.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn isolated(mut self) -> Self {
        self.options.isolated = true;
        self
    }

    pub fn on_error(mut self, mode: ErrorMode) -> Self {
        self.options.on_error = mode;
        self
    }
}

/// Connection between an output port of one node and an input port of another
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub from_node: NodeId,
    pub from_port: String,
    pub to_node: NodeId,
    pub to_port: String,
}

/// Per-node execution options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeOptions {
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Per-attempt timeout; the engine default applies when unset
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub isolated: bool,
    #[serde(default)]
    pub on_error: ErrorMode,
}

/// What the orchestrator does with the rest of the run when this node fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorMode {
    #[default]
    Halt,
    ContinueSiblings,
}

/// Retry policy for node execution.
///
/// `max_attempts` counts every attempt including the first; 0 and 1 both
/// mean the node runs once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_interval_ms: u64,
    pub backoff_coefficient: f64,
    pub max_interval_ms: u64,
    pub retry_isolation_faults: bool,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn exponential(max_attempts: u32, initial_interval_ms: u64, backoff_coefficient: f64) -> Self {
        Self {
            max_attempts,
            initial_interval_ms,
            backoff_coefficient,
            ..Self::default()
        }
    }

    pub fn with_max_interval_ms(mut self, max_interval_ms: u64) -> Self {
        self.max_interval_ms = max_interval_ms;
        self
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_interval_ms: 1000,
            backoff_coefficient: 2.0,
            max_interval_ms: 60_000,
            retry_isolation_faults: false,
        }
    }
}

/// Workflow-wide overrides of the engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowSettings {
    /// Aggregate run timeout; cancels the whole run once elapsed
    #[serde(default)]
    pub max_execution_time_ms: Option<u64>,
    #[serde(default)]
    pub max_parallel_nodes: Option<usize>,
}
