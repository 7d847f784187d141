use crate::{ErrorKind, NodeError, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Terminal outcome of a node within a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NodeResult {
    Success { output: HashMap<String, Value> },
    Failed { kind: ErrorKind, message: String },
    Skipped { reason: String },
}

impl NodeResult {
    pub fn success(output: HashMap<String, Value>) -> Self {
        NodeResult::Success { output }
    }

    pub fn failed(error: &NodeError) -> Self {
        NodeResult::Failed {
            kind: error.kind(),
            message: error.to_string(),
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        NodeResult::Skipped {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, NodeResult::Success { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, NodeResult::Failed { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, NodeResult::Skipped { .. })
    }

    /// Output port values, empty unless the node succeeded
    pub fn output(&self) -> Option<&HashMap<String, Value>> {
        match self {
            NodeResult::Success { output } => Some(output),
            _ => None,
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            NodeResult::Failed { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// Lifecycle of an execution run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Succeeded | RunState::Failed | RunState::Cancelled)
    }

    /// `Pending -> Running -> {Succeeded, Failed, Cancelled}`. A pending run
    /// may also be cancelled or fail before it starts.
    pub fn can_transition_to(&self, next: RunState) -> bool {
        match (self, next) {
            (RunState::Pending, RunState::Running) => true,
            (RunState::Pending, RunState::Cancelled | RunState::Failed) => true,
            (RunState::Running, s) => s.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunState::Pending => "pending",
            RunState::Running => "running",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
            RunState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_result_carries_kind_and_message() {
        let result = NodeResult::failed(&NodeError::TransientIo("reset".into()));
        assert_eq!(result.error_kind(), Some(ErrorKind::TransientIo));
        assert!(matches!(result, NodeResult::Failed { ref message, .. } if message.contains("reset")));
    }

    #[test]
    fn state_machine_transitions() {
        assert!(RunState::Pending.can_transition_to(RunState::Running));
        assert!(RunState::Running.can_transition_to(RunState::Succeeded));
        assert!(RunState::Running.can_transition_to(RunState::Cancelled));
        assert!(!RunState::Running.can_transition_to(RunState::Pending));
        assert!(!RunState::Succeeded.can_transition_to(RunState::Failed));
        assert!(!RunState::Cancelled.can_transition_to(RunState::Running));
    }

    #[test]
    fn result_json_is_tagged_by_status() {
        let json = serde_json::to_value(NodeResult::skipped("upstream node 'a' failed")).unwrap();
        assert_eq!(json["status"], "skipped");
        assert_eq!(json["reason"], "upstream node 'a' failed");
    }
}
