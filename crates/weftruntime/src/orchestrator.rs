use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::config::EngineConfig;
use crate::context::LogLevel;
use crate::executor::{NodeExecutor, NodeInvocation};
use crate::graph::DependencyGraph;
use crate::registry::NodeRegistry;
use crate::retry::{RetryController, RetryOutcome};
use crate::run::{ExecutionRun, PreparedNode};
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use weftcore::{
    CheckpointError, ErrorMode, EventBus, ExecutionEvent, FlowError, NodeError, NodeId, NodeOutput,
    NodeResult, RunId, RunState, ValidationError, Value, WorkflowDefinition,
};

/// Drives runs through their lifecycle: dispatches ready nodes onto a
/// bounded set of tasks, applies error modes, checkpoints outcomes and
/// finalizes the run state.
pub struct Orchestrator {
    registry: Arc<NodeRegistry>,
    executor: Arc<NodeExecutor>,
    retry: Arc<RetryController>,
    checkpoints: Arc<dyn CheckpointStore>,
    events: Arc<EventBus>,
    config: EngineConfig,
}

/// Why the scheduler stopped dispatching before the graph was exhausted
enum Stop {
    Halted(NodeId),
    CheckpointFailed(String),
}

struct Completion {
    node_id: NodeId,
    outcome: Result<RetryOutcome, String>,
    duration: Duration,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<NodeRegistry>,
        executor: Arc<NodeExecutor>,
        checkpoints: Arc<dyn CheckpointStore>,
        events: Arc<EventBus>,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            executor,
            retry: Arc::new(RetryController::new(events.clone())),
            checkpoints,
            events,
            config,
        }
    }

    /// Build the graph and instantiate every node. Any failure here aborts
    /// run creation; nothing has executed yet.
    pub fn prepare(
        &self,
        run_id: RunId,
        workflow: WorkflowDefinition,
        payload: HashMap<String, Value>,
    ) -> Result<Arc<ExecutionRun>, FlowError> {
        let graph = DependencyGraph::build(&workflow)?;

        let mut nodes = HashMap::new();
        for spec in &workflow.nodes {
            let instance = self.registry.instantiate(&spec.node_type, &spec.config)?;
            let isolated = spec.options.isolated || self.registry.requires_isolation(&spec.node_type);
            if isolated && !self.executor.supports_isolation() {
                return Err(ValidationError::Rejected {
                    node_type: spec.node_type.clone(),
                    message: format!(
                        "node '{}' requires isolation but no worker program is configured",
                        spec.id
                    ),
                }
                .into());
            }
            nodes.insert(spec.id.clone(), PreparedNode { instance, isolated });
        }

        tracing::debug!(
            run_id = %run_id,
            workflow_id = %workflow.id,
            nodes = nodes.len(),
            "prepared run"
        );
        Ok(Arc::new(ExecutionRun::new(
            run_id,
            Arc::new(workflow),
            graph,
            nodes,
            payload,
        )))
    }

    /// Execute a prepared run to completion. `resumed` seeds nodes that
    /// already settled in an earlier attempt of the same run.
    pub async fn run(&self, run: Arc<ExecutionRun>, resumed: Vec<Checkpoint>) -> RunState {
        let started = Instant::now();
        let run_id = run.run_id();
        let context = run.context().clone();
        let graph = run.graph();
        let workflow = run.workflow();

        if let Err(e) = run.transition(RunState::Running) {
            tracing::error!(run_id = %run_id, error = %e, "run could not start");
            return run.state();
        }

        tracing::info!(
            run_id = %run_id,
            workflow = %workflow.name,
            resumed_nodes = resumed.len(),
            "run started"
        );
        context
            .log(LogLevel::Info, None, format!("run started ({} nodes)", graph.len()))
            .await;
        self.events.emit(ExecutionEvent::RunStarted {
            run_id,
            workflow_id: workflow.id,
            resumed_nodes: resumed.len(),
            timestamp: Utc::now(),
        });

        let mut completed: HashSet<NodeId> = HashSet::new();
        let mut stop: Option<Stop> = None;

        // Seed results from the checkpoint log
        let mut continued_failures = Vec::new();
        for checkpoint in resumed {
            if !graph.contains(&checkpoint.node_id) || completed.contains(&checkpoint.node_id) {
                continue;
            }
            if checkpoint.result.is_failed() {
                match self.error_mode(workflow, &checkpoint.node_id) {
                    ErrorMode::Halt => {
                        stop.get_or_insert(Stop::Halted(checkpoint.node_id.clone()));
                    }
                    ErrorMode::ContinueSiblings => continued_failures.push(checkpoint.node_id.clone()),
                }
            }
            if let Err(e) = context
                .record(&checkpoint.node_id, checkpoint.result, checkpoint.variables)
                .await
            {
                tracing::warn!(run_id = %run_id, error = %e, "skipping duplicate checkpoint");
            }
            completed.insert(checkpoint.node_id);
        }
        // Dependents of a failure may not have been checkpointed before the interruption
        for failed in continued_failures {
            if let Err(e) = self.skip_descendants(&run, &failed, &mut completed).await {
                stop.get_or_insert(Stop::CheckpointFailed(e.to_string()));
            }
        }

        let max_parallel = workflow
            .settings
            .max_parallel_nodes
            .unwrap_or(self.config.max_parallel_nodes)
            .max(1);
        let run_timeout = workflow
            .settings
            .max_execution_time_ms
            .or(self.config.run_timeout_ms)
            .map(Duration::from_millis);
        let deadline = async move {
            match run_timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(deadline);

        let mut running = FuturesUnordered::new();
        let mut in_flight: HashSet<NodeId> = HashSet::new();
        let mut cancelled = context.is_cancelled();

        loop {
            if stop.is_none() && !cancelled {
                let mut ready: Vec<NodeId> = graph
                    .ready_nodes(&completed)
                    .into_iter()
                    .filter(|id| !in_flight.contains(id))
                    .collect();
                ready.truncate(max_parallel.saturating_sub(in_flight.len()));

                for node_id in ready {
                    let task = self.dispatch(&run, &node_id).await;
                    let id = node_id.clone();
                    running.push(tokio::spawn(task).map(move |joined| (id, joined)));
                    in_flight.insert(node_id);
                }
            }

            if running.is_empty() {
                break;
            }

            tokio::select! {
                Some((node_id, joined)) = running.next() => {
                    in_flight.remove(&node_id);
                    let completion = match joined {
                        Ok(completion) => completion,
                        Err(e) => Completion {
                            node_id: node_id.clone(),
                            outcome: Err(format!("node task aborted: {}", e)),
                            duration: Duration::ZERO,
                        },
                    };
                    if let Err(e) = self.settle(&run, completion, &mut completed, &mut stop).await {
                        tracing::error!(run_id = %run_id, error = %e, "checkpoint write failed, aborting run");
                        context.log(LogLevel::Error, None, format!("checkpoint write failed: {}", e)).await;
                        stop.get_or_insert(Stop::CheckpointFailed(e.to_string()));
                    }
                }
                _ = context.cancellation().cancelled(), if !cancelled => {
                    cancelled = true;
                    tracing::info!(run_id = %run_id, in_flight = in_flight.len(), "run cancellation requested");
                    context.log(LogLevel::Warn, None, "run cancelled").await;
                }
                _ = &mut deadline, if !cancelled => {
                    cancelled = true;
                    context.cancel();
                    tracing::warn!(run_id = %run_id, "run timeout elapsed, cancelling");
                    context.log(LogLevel::Warn, None, "run timeout elapsed").await;
                }
            }
        }

        // A cancel that lands after the last completion still wins
        cancelled |= context.is_cancelled();

        let leftover_reason = if cancelled {
            "run cancelled".to_string()
        } else {
            match &stop {
                Some(Stop::Halted(node_id)) => format!("run halted: node '{}' failed", node_id),
                Some(Stop::CheckpointFailed(error)) => {
                    format!("run aborted: checkpoint write failed: {}", error)
                }
                None => "not reached".to_string(),
            }
        };
        for node_id in graph.topological_order() {
            if !completed.contains(node_id) {
                self.mark_skipped(&run, node_id, &leftover_reason).await;
                completed.insert(node_id.clone());
            }
        }

        let results = context.results().await;
        let final_state = if cancelled {
            RunState::Cancelled
        } else if stop.is_some() {
            RunState::Failed
        } else if graph
            .terminals()
            .iter()
            .any(|id| results.get(id).map(NodeResult::is_success).unwrap_or(false))
        {
            RunState::Succeeded
        } else {
            RunState::Failed
        };

        if let Err(e) = run.transition(final_state) {
            tracing::error!(run_id = %run_id, error = %e, "run finalization rejected");
            return run.state();
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(run_id = %run_id, state = %final_state, duration_ms, "run finished");
        context
            .log(LogLevel::Info, None, format!("run finished: {}", final_state))
            .await;
        self.events.emit(ExecutionEvent::RunCompleted {
            run_id,
            state: final_state,
            duration_ms,
            timestamp: Utc::now(),
        });
        final_state
    }

    /// Bind inputs, announce the node and build its task future
    async fn dispatch(
        &self,
        run: &Arc<ExecutionRun>,
        node_id: &NodeId,
    ) -> BoxFuture<'static, Completion> {
        let context = run.context().clone();
        let workflow = run.workflow();
        let spec = workflow.find_node(node_id).cloned();
        let prepared = run.nodes.get(node_id).cloned();

        let inputs = context.bind_inputs(node_id, &workflow.connections).await;
        let variables = context.variables().await;
        let default_timeout = self.config.default_node_timeout();

        let node_type = spec.as_ref().map(|s| s.node_type.clone()).unwrap_or_default();
        tracing::debug!(run_id = %run.run_id(), node_id = %node_id, node_type = %node_type, "dispatching node");
        context
            .log(LogLevel::Debug, Some(node_id), format!("started ({})", node_type))
            .await;
        self.events.emit(ExecutionEvent::NodeStarted {
            run_id: run.run_id(),
            node_id: node_id.clone(),
            node_type: node_type.clone(),
            timestamp: Utc::now(),
        });

        let executor = self.executor.clone();
        let retry = self.retry.clone();
        let run_id = run.run_id();
        let node_id = node_id.clone();

        async move {
            let started = Instant::now();
            let (Some(spec), Some(prepared)) = (spec, prepared) else {
                return Completion {
                    node_id,
                    outcome: Err("node was not prepared".to_string()),
                    duration: Duration::ZERO,
                };
            };

            let timeout = spec.options.timeout_ms.map(Duration::from_millis).unwrap_or(default_timeout);
            let cancellation = context.cancellation().clone();
            let outcome = retry
                .run(&spec.options.retry, &context, &node_id, |attempt| {
                    let invocation = NodeInvocation {
                        run_id,
                        node_id: node_id.clone(),
                        node_type: spec.node_type.clone(),
                        attempt,
                        config: spec.config.clone(),
                        inputs: inputs.clone(),
                        variables: variables.clone(),
                        timeout,
                        isolated: prepared.isolated,
                    };
                    let executor = executor.clone();
                    let instance = prepared.instance.clone();
                    let cancellation = cancellation.clone();
                    async move { executor.execute(&instance, invocation, &cancellation).await }
                })
                .await;

            Completion {
                node_id,
                outcome: Ok(outcome),
                duration: started.elapsed(),
            }
        }
        .boxed()
    }

    /// Turn a finished task into a terminal node result
    async fn settle(
        &self,
        run: &Arc<ExecutionRun>,
        completion: Completion,
        completed: &mut HashSet<NodeId>,
        stop: &mut Option<Stop>,
    ) -> Result<(), CheckpointError> {
        let context = run.context();
        let run_id = run.run_id();
        let node_id = completion.node_id;
        completed.insert(node_id.clone());

        let (result, attempts) = match completion.outcome {
            Ok(RetryOutcome { result, attempts }) => (result, attempts),
            Err(message) => (Err(NodeError::ExecutionFailed(message)), 1),
        };

        match result {
            Ok(NodeOutput {
                outputs,
                variables,
                metadata,
            }) => {
                tracing::info!(
                    run_id = %run_id,
                    node_id = %node_id,
                    attempts,
                    isolated = metadata.isolated,
                    duration_ms = completion.duration.as_millis() as u64,
                    "node completed"
                );
                self.persist(run, &node_id, NodeResult::success(outputs.clone()), variables)
                    .await?;
                context.log(LogLevel::Info, Some(&node_id), "completed").await;
                self.events.emit(ExecutionEvent::NodeCompleted {
                    run_id,
                    node_id,
                    outputs,
                    duration_ms: completion.duration.as_millis() as u64,
                    timestamp: Utc::now(),
                });
            }
            Err(NodeError::Cancelled) if context.is_cancelled() => {
                // Run-level outcome; not checkpointed so resume runs it again
                self.mark_skipped(run, &node_id, "cancelled").await;
            }
            Err(error) => {
                tracing::error!(
                    run_id = %run_id,
                    node_id = %node_id,
                    attempts,
                    kind = %error.kind(),
                    error = %error,
                    "node failed"
                );
                self.persist(run, &node_id, NodeResult::failed(&error), HashMap::new())
                    .await?;
                context
                    .log(LogLevel::Error, Some(&node_id), format!("failed after {} attempt(s): {}", attempts, error))
                    .await;
                self.events.emit(ExecutionEvent::NodeFailed {
                    run_id,
                    node_id: node_id.clone(),
                    kind: error.kind(),
                    error: error.to_string(),
                    timestamp: Utc::now(),
                });

                match self.error_mode(run.workflow(), &node_id) {
                    ErrorMode::Halt => {
                        stop.get_or_insert(Stop::Halted(node_id));
                    }
                    ErrorMode::ContinueSiblings => {
                        self.skip_descendants(run, &node_id, completed).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Skip everything downstream of a failed node, checkpointing each skip
    async fn skip_descendants(
        &self,
        run: &Arc<ExecutionRun>,
        failed: &str,
        completed: &mut HashSet<NodeId>,
    ) -> Result<(), CheckpointError> {
        let descendants: HashSet<NodeId> = run.graph().descendants(failed).into_iter().collect();
        let reason = format!("upstream node '{}' failed", failed);

        for node_id in run.graph().topological_order() {
            if !descendants.contains(node_id) || completed.contains(node_id) {
                continue;
            }
            self.persist(run, node_id, NodeResult::skipped(reason.clone()), HashMap::new())
                .await?;
            completed.insert(node_id.clone());
            self.announce_skip(run, node_id, &reason).await;
        }
        Ok(())
    }

    /// Checkpoint first, then make the result visible in the context
    async fn persist(
        &self,
        run: &Arc<ExecutionRun>,
        node_id: &str,
        result: NodeResult,
        variables: HashMap<String, Value>,
    ) -> Result<(), CheckpointError> {
        let checkpoint = Checkpoint::new(run.run_id(), node_id, result, variables);
        let written = self.checkpoints.append(&checkpoint).await;

        if let Err(e) = run
            .context()
            .record(node_id, checkpoint.result, checkpoint.variables)
            .await
        {
            tracing::warn!(run_id = %run.run_id(), node_id = %node_id, error = %e, "result already recorded");
        }
        written
    }

    /// Record a run-level skip without checkpointing it
    async fn mark_skipped(&self, run: &Arc<ExecutionRun>, node_id: &str, reason: &str) {
        if let Err(e) = run
            .context()
            .record(node_id, NodeResult::skipped(reason), HashMap::new())
            .await
        {
            tracing::warn!(run_id = %run.run_id(), node_id = %node_id, error = %e, "result already recorded");
            return;
        }
        self.announce_skip(run, node_id, reason).await;
    }

    async fn announce_skip(&self, run: &Arc<ExecutionRun>, node_id: &str, reason: &str) {
        tracing::info!(run_id = %run.run_id(), node_id = %node_id, reason, "node skipped");
        run.context()
            .log(LogLevel::Warn, Some(node_id), format!("skipped: {}", reason))
            .await;
        self.events.emit(ExecutionEvent::NodeSkipped {
            run_id: run.run_id(),
            node_id: node_id.to_string(),
            reason: reason.to_string(),
            timestamp: Utc::now(),
        });
    }

    fn error_mode(&self, workflow: &WorkflowDefinition, node_id: &str) -> ErrorMode {
        workflow
            .find_node(node_id)
            .map(|spec| spec.options.on_error)
            .unwrap_or_default()
    }
}
