use crate::context::{ExecutionContext, LogEntry};
use crate::graph::DependencyGraph;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use weftcore::{FlowError, Node, NodeId, NodeResult, RunId, RunState, Value, WorkflowDefinition, WorkflowId};

/// A prepared node: its validated instance and resolved isolation flag
#[derive(Clone)]
pub(crate) struct PreparedNode {
    pub instance: Arc<dyn Node>,
    pub isolated: bool,
}

#[derive(Debug, Clone)]
struct Lifecycle {
    state: RunState,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

/// One invocation of a workflow. Owns the run's execution context and
/// moves through `Pending -> Running -> {Succeeded, Failed, Cancelled}`
/// exactly once.
pub struct ExecutionRun {
    run_id: RunId,
    workflow: Arc<WorkflowDefinition>,
    graph: DependencyGraph,
    pub(crate) nodes: HashMap<NodeId, PreparedNode>,
    context: ExecutionContext,
    lifecycle: Mutex<Lifecycle>,
    state_tx: watch::Sender<RunState>,
}

impl ExecutionRun {
    pub(crate) fn new(
        run_id: RunId,
        workflow: Arc<WorkflowDefinition>,
        graph: DependencyGraph,
        nodes: HashMap<NodeId, PreparedNode>,
        payload: HashMap<String, Value>,
    ) -> Self {
        let (state_tx, _) = watch::channel(RunState::Pending);
        Self {
            run_id,
            workflow,
            graph,
            nodes,
            context: ExecutionContext::new(run_id, payload),
            lifecycle: Mutex::new(Lifecycle {
                state: RunState::Pending,
                created_at: Utc::now(),
                started_at: None,
                finished_at: None,
            }),
            state_tx,
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn workflow(&self) -> &WorkflowDefinition {
        &self.workflow
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    pub fn state(&self) -> RunState {
        *self.state_tx.borrow()
    }

    /// Move to `next`, rejecting transitions the state machine forbids
    pub(crate) fn transition(&self, next: RunState) -> Result<(), FlowError> {
        let mut lifecycle = self
            .lifecycle
            .lock()
            .map_err(|_| FlowError::Execution("run lifecycle lock poisoned".into()))?;

        if !lifecycle.state.can_transition_to(next) {
            return Err(FlowError::Execution(format!(
                "illegal run transition {} -> {}",
                lifecycle.state, next
            )));
        }

        let now = Utc::now();
        if next == RunState::Running {
            lifecycle.started_at = Some(now);
        }
        if next.is_terminal() {
            lifecycle.finished_at = Some(now);
        }
        lifecycle.state = next;
        self.state_tx.send_replace(next);
        Ok(())
    }

    /// Resolve once the run reaches a terminal state
    pub async fn finished(&self) -> RunState {
        let mut rx = self.state_tx.subscribe();
        let result = rx.wait_for(RunState::is_terminal).await.map(|state| *state);
        // The sender lives as long as `self`, so the channel cannot close here
        result.unwrap_or_else(|_| self.state())
    }

    pub fn cancel(&self) {
        self.context.cancel();
    }

    pub async fn status(&self) -> RunStatus {
        let lifecycle = match self.lifecycle.lock() {
            Ok(lifecycle) => lifecycle.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        RunStatus {
            run_id: self.run_id,
            workflow_id: self.workflow.id,
            state: lifecycle.state,
            results: self.context.results().await,
            variables: self.context.variables().await,
            log: self.context.log_entries().await,
            created_at: lifecycle.created_at,
            started_at: lifecycle.started_at,
            finished_at: lifecycle.finished_at,
        }
    }
}

/// Point-in-time view of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStatus {
    pub run_id: RunId,
    pub workflow_id: WorkflowId,
    pub state: RunState,
    pub results: HashMap<NodeId, NodeResult>,
    pub variables: HashMap<String, Value>,
    pub log: Vec<LogEntry>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunStatus {
    pub fn result(&self, node_id: &str) -> Option<&NodeResult> {
        self.results.get(node_id)
    }

    pub fn duration_ms(&self) -> Option<i64> {
        Some((self.finished_at? - self.started_at?).num_milliseconds())
    }
}
