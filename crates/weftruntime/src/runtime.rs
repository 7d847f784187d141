use crate::checkpoint::{Checkpoint, CheckpointStore, MemoryCheckpointStore};
use crate::config::EngineConfig;
use crate::executor::NodeExecutor;
use crate::isolation::IsolationChannel;
use crate::orchestrator::Orchestrator;
use crate::registry::NodeRegistry;
use crate::run::{ExecutionRun, RunStatus};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;
use weftcore::{EventBus, ExecutionEvent, FlowError, RunId, Value, WorkflowDefinition};

/// Final snapshots of finished runs, oldest evicted first
#[derive(Default)]
struct RunArchive {
    statuses: HashMap<RunId, RunStatus>,
    order: VecDeque<RunId>,
}

impl RunArchive {
    fn insert(&mut self, status: RunStatus, capacity: usize) {
        let run_id = status.run_id;
        if self.statuses.insert(run_id, status).is_some() {
            self.order.retain(|id| *id != run_id);
        }
        self.order.push_back(run_id);
        while self.order.len() > capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.statuses.remove(&evicted);
            }
        }
    }
}

enum Tracked {
    Active(Arc<ExecutionRun>),
    Finished(RunStatus),
}

/// Main entry point for executing workflows.
///
/// Runs are prepared synchronously in [`Engine::submit`] and then execute on
/// background tasks. Once a run finishes its live state is released and
/// only a status snapshot is kept, up to `retained_runs` of them. Every
/// method is safe to call concurrently.
pub struct Engine {
    registry: Arc<NodeRegistry>,
    orchestrator: Arc<Orchestrator>,
    checkpoints: Arc<dyn CheckpointStore>,
    event_bus: Arc<EventBus>,
    runs: Arc<RwLock<HashMap<RunId, Arc<ExecutionRun>>>>,
    archive: Arc<RwLock<RunArchive>>,
    config: EngineConfig,
}

impl Engine {
    /// Create an engine that keeps checkpoints in memory
    pub fn new(registry: Arc<NodeRegistry>, config: EngineConfig) -> Result<Self, FlowError> {
        Self::with_checkpoint_store(registry, config, Arc::new(MemoryCheckpointStore::new()))
    }

    pub fn with_checkpoint_store(
        registry: Arc<NodeRegistry>,
        config: EngineConfig,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Result<Self, FlowError> {
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));
        let isolation = match config.isolation.worker_program {
            Some(_) => Some(Arc::new(IsolationChannel::new(config.isolation.clone())?)),
            None => None,
        };
        let executor = Arc::new(NodeExecutor::new(event_bus.clone(), isolation));
        let orchestrator = Arc::new(Orchestrator::new(
            registry.clone(),
            executor,
            checkpoints.clone(),
            event_bus.clone(),
            config.clone(),
        ));

        Ok(Self {
            registry,
            orchestrator,
            checkpoints,
            event_bus,
            runs: Arc::new(RwLock::new(HashMap::new())),
            archive: Arc::new(RwLock::new(RunArchive::default())),
            config,
        })
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validate and start a run. Cycles, unknown node types and bad node
    /// configuration are rejected here, before anything executes.
    pub async fn submit(
        &self,
        workflow: WorkflowDefinition,
        payload: HashMap<String, Value>,
    ) -> Result<RunId, FlowError> {
        let run_id = Uuid::new_v4();
        let run = self.orchestrator.prepare(run_id, workflow, payload)?;
        self.runs.write().await.insert(run_id, run.clone());
        self.spawn(run, Vec::new());
        Ok(run_id)
    }

    /// Re-run an interrupted run under the same id. Nodes with a checkpoint
    /// keep their recorded result and are not executed again.
    pub async fn resume(
        &self,
        workflow: WorkflowDefinition,
        run_id: RunId,
        payload: HashMap<String, Value>,
    ) -> Result<RunId, FlowError> {
        // Held until the new run is registered so concurrent resumes of one id serialize
        let mut runs = self.runs.write().await;
        if let Some(existing) = runs.get(&run_id) {
            if !existing.state().is_terminal() {
                return Err(FlowError::Execution(format!("run {} is still active", run_id)));
            }
        }

        let checkpoints = self.checkpoints.load(run_id).await?;
        let run = self.orchestrator.prepare(run_id, workflow, payload)?;
        tracing::info!(run_id = %run_id, checkpoints = checkpoints.len(), "resuming run");
        runs.insert(run_id, run.clone());
        drop(runs);

        self.spawn(run, checkpoints);
        Ok(run_id)
    }

    pub async fn status(&self, run_id: RunId) -> Result<RunStatus, FlowError> {
        match self.lookup(run_id).await? {
            Tracked::Active(run) => Ok(run.status().await),
            Tracked::Finished(status) => Ok(status),
        }
    }

    /// Request cancellation. Returns once the signal is sent; use
    /// [`Engine::wait`] to observe the final state. Cancelling a finished
    /// run is a no-op.
    pub async fn cancel(&self, run_id: RunId) -> Result<(), FlowError> {
        match self.lookup(run_id).await? {
            Tracked::Active(run) => {
                tracing::info!(run_id = %run_id, state = %run.state(), "cancel requested");
                run.cancel();
            }
            Tracked::Finished(status) => {
                tracing::debug!(run_id = %run_id, state = %status.state, "cancel of a finished run ignored");
            }
        }
        Ok(())
    }

    /// Wait for a run to finish and return its final status
    pub async fn wait(&self, run_id: RunId) -> Result<RunStatus, FlowError> {
        match self.lookup(run_id).await? {
            Tracked::Active(run) => {
                run.finished().await;
                Ok(run.status().await)
            }
            Tracked::Finished(status) => Ok(status),
        }
    }

    /// Submit and wait
    pub async fn execute(
        &self,
        workflow: WorkflowDefinition,
        payload: HashMap<String, Value>,
    ) -> Result<RunStatus, FlowError> {
        let run_id = self.submit(workflow, payload).await?;
        self.wait(run_id).await
    }

    /// Run ids this engine can report on, active and retained, in no
    /// particular order
    pub async fn runs(&self) -> Vec<RunId> {
        let mut ids: HashSet<RunId> = self.runs.read().await.keys().copied().collect();
        ids.extend(self.archive.read().await.order.iter().copied());
        ids.into_iter().collect()
    }

    /// Runs whose live state is still held
    pub async fn active_runs(&self) -> Vec<RunId> {
        self.runs.read().await.keys().copied().collect()
    }

    /// Subscribe to execution events of every run
    pub fn subscribe_events(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.event_bus.subscribe()
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Drive a registered run, then swap its live state for a snapshot
    fn spawn(&self, run: Arc<ExecutionRun>, resumed: Vec<Checkpoint>) {
        let orchestrator = self.orchestrator.clone();
        let runs = self.runs.clone();
        let archive = self.archive.clone();
        let retained = self.config.retained_runs;

        tokio::spawn(async move {
            orchestrator.run(run.clone(), resumed).await;
            let status = run.status().await;
            let run_id = run.run_id();

            // Archive before releasing so lookups always find one or the other
            let mut runs = runs.write().await;
            archive.write().await.insert(status, retained);
            if runs.get(&run_id).is_some_and(|current| Arc::ptr_eq(current, &run)) {
                runs.remove(&run_id);
            }
            tracing::debug!(run_id = %run_id, "run archived");
        });
    }

    async fn lookup(&self, run_id: RunId) -> Result<Tracked, FlowError> {
        if let Some(run) = self.runs.read().await.get(&run_id).cloned() {
            return Ok(Tracked::Active(run));
        }
        self.archive
            .read()
            .await
            .statuses
            .get(&run_id)
            .cloned()
            .map(Tracked::Finished)
            .ok_or(FlowError::RunNotFound(run_id))
    }
}
