//! Workflow execution runtime
//!
//! This crate provides the engine that runs workflows: the node registry
//! and its configuration schemas, the dependency graph, per-run execution
//! context, node executor with retries, out-of-process isolation, the
//! checkpoint stores and the orchestrator that ties them together behind
//! [`Engine`].

mod checkpoint;
mod config;
mod context;
mod executor;
mod graph;
pub mod isolation;
mod orchestrator;
mod registry;
mod retry;
mod run;
mod runtime;
mod schema;

pub use checkpoint::{Checkpoint, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use config::{EngineConfig, IsolationConfig};
pub use context::{ExecutionContext, LogEntry, LogLevel};
pub use executor::{run_in_process, NodeExecutor, NodeInvocation};
pub use graph::DependencyGraph;
pub use orchestrator::Orchestrator;
pub use registry::{NodeFactory, NodeMetadata, NodeRegistry, PortDefinition};
pub use retry::{backoff_delay, is_retryable, RetryController, RetryOutcome};
pub use run::{ExecutionRun, RunStatus};
pub use runtime::Engine;
pub use schema::{ConfigSchema, FieldSpec, FieldType};
