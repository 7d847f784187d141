//! Per-run mutable state: node results, published variables, a structured
//! log and the cancellation signal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use weftcore::{Connection, FlowError, NodeId, NodeResult, RunId, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub node_id: Option<NodeId>,
    pub message: String,
}

#[derive(Debug, Default)]
struct ContextState {
    results: HashMap<NodeId, NodeResult>,
    variables: HashMap<String, Value>,
    log: Vec<LogEntry>,
}

/// Shared handle to a run's execution context. Cloning is cheap; all clones
/// see the same state.
#[derive(Clone)]
pub struct ExecutionContext {
    run_id: RunId,
    payload: Arc<HashMap<String, Value>>,
    state: Arc<RwLock<ContextState>>,
    cancellation: CancellationToken,
}

impl ExecutionContext {
    pub fn new(run_id: RunId, payload: HashMap<String, Value>) -> Self {
        Self {
            run_id,
            payload: Arc::new(payload),
            state: Arc::new(RwLock::new(ContextState::default())),
            cancellation: CancellationToken::new(),
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn payload(&self) -> &HashMap<String, Value> {
        &self.payload
    }

    /// Write a node's terminal result and publish its variables. A result
    /// is written at most once per node.
    pub async fn record(
        &self,
        node_id: &str,
        result: NodeResult,
        variables: HashMap<String, Value>,
    ) -> Result<(), FlowError> {
        let mut state = self.state.write().await;
        if state.results.contains_key(node_id) {
            return Err(FlowError::Execution(format!(
                "result for node '{}' already recorded",
                node_id
            )));
        }
        state.variables.extend(variables);
        state.results.insert(node_id.to_string(), result);
        Ok(())
    }

    pub async fn result(&self, node_id: &str) -> Option<NodeResult> {
        self.state.read().await.results.get(node_id).cloned()
    }

    pub async fn results(&self) -> HashMap<NodeId, NodeResult> {
        self.state.read().await.results.clone()
    }

    pub async fn variables(&self) -> HashMap<String, Value> {
        self.state.read().await.variables.clone()
    }

    pub async fn variable(&self, name: &str) -> Option<Value> {
        self.state.read().await.variables.get(name).cloned()
    }

    /// Resolve a node's inputs from upstream outputs. Root nodes receive
    /// the run payload.
    pub async fn bind_inputs(
        &self,
        node_id: &str,
        connections: &[Connection],
    ) -> HashMap<String, Value> {
        let mut inputs = HashMap::new();
        let incoming: Vec<&Connection> = connections
            .iter()
            .filter(|conn| conn.to_node == node_id)
            .collect();

        if incoming.is_empty() {
            inputs.extend(self.payload.iter().map(|(k, v)| (k.clone(), v.clone())));
            return inputs;
        }

        let state = self.state.read().await;
        for conn in incoming {
            let value = state
                .results
                .get(&conn.from_node)
                .and_then(NodeResult::output)
                .and_then(|outputs| outputs.get(&conn.from_port));
            if let Some(value) = value {
                inputs.insert(conn.to_port.clone(), value.clone());
            }
        }
        inputs
    }

    pub async fn log(&self, level: LogLevel, node_id: Option<&str>, message: impl Into<String>) {
        self.state.write().await.log.push(LogEntry {
            timestamp: Utc::now(),
            level,
            node_id: node_id.map(str::to_string),
            message: message.into(),
        });
    }

    pub async fn log_entries(&self) -> Vec<LogEntry> {
        self.state.read().await.log.clone()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}
