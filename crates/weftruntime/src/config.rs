use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use weftcore::FlowError;

/// Configuration for the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on nodes executing at once within a run
    pub max_parallel_nodes: usize,

    /// Per-attempt timeout for nodes that do not set their own
    pub default_node_timeout_ms: u64,

    /// Run-level timeout; an elapsed run is cancelled
    pub run_timeout_ms: Option<u64>,

    pub event_buffer_size: usize,

    /// Finished runs whose final status stays queryable; older ones are forgotten
    pub retained_runs: usize,

    pub isolation: IsolationConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_nodes: 10,
            default_node_timeout_ms: 30_000,
            run_timeout_ms: None,
            event_buffer_size: 1000,
            retained_runs: 1000,
            isolation: IsolationConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load from a JSON file; missing fields take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, FlowError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn default_node_timeout(&self) -> Duration {
        Duration::from_millis(self.default_node_timeout_ms)
    }
}

/// Settings for out-of-process node execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationConfig {
    /// Worker executable. Isolated nodes are rejected at submit when unset.
    pub worker_program: Option<PathBuf>,

    pub worker_args: Vec<String>,

    /// Concurrently running worker processes across all runs
    pub max_workers: usize,

    /// Idle workers kept per node type for reuse
    pub max_idle_per_type: usize,

    /// Resident memory ceiling per worker
    pub max_memory_bytes: Option<u64>,

    /// CPU time ceiling per call
    pub max_cpu_ms: Option<u64>,

    pub monitor_interval_ms: u64,

    pub max_frame_bytes: usize,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            worker_program: None,
            worker_args: Vec::new(),
            max_workers: 4,
            max_idle_per_type: 2,
            max_memory_bytes: None,
            max_cpu_ms: None,
            monitor_interval_ms: 50,
            max_frame_bytes: 16 * 1024 * 1024,
        }
    }
}

impl IsolationConfig {
    pub fn with_worker(program: impl Into<PathBuf>) -> Self {
        Self {
            worker_program: Some(program.into()),
            ..Self::default()
        }
    }
}
