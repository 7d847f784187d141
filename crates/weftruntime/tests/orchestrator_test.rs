use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;
use weftcore::{
    CheckpointError, ErrorKind, ErrorMode, ExecutionEvent, FlowError, Node, NodeContext, NodeError,
    NodeOutput, NodeResult, NodeSpec, RetryPolicy, RunId, RunState, Value, WorkflowDefinition,
    WorkflowError,
};
use weftruntime::{
    Checkpoint, CheckpointStore, ConfigSchema, Engine, EngineConfig, FieldType,
    MemoryCheckpointStore, NodeRegistry,
};

/// Shared bookkeeping for every scripted node built by one registry
#[derive(Default)]
struct Tally {
    calls: Mutex<HashMap<String, u32>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl Tally {
    fn calls(&self, node_id: &str) -> u32 {
        self.calls.lock().unwrap().get(node_id).copied().unwrap_or(0)
    }
}

/// Test node: sleeps for `delay_ms`, fails transiently for the first
/// `fail_first` calls, fails for good when `fail` is set, and otherwise
/// passes its inputs through with its own id under `from`.
struct Scripted {
    tally: Arc<Tally>,
    delay: Duration,
    fail_first: u32,
    fail: Option<String>,
}

#[async_trait]
impl Node for Scripted {
    fn node_type(&self) -> &str {
        "test.scripted"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let call = {
            let mut calls = self.tally.calls.lock().unwrap();
            let entry = calls.entry(ctx.node_id.clone()).or_insert(0);
            *entry += 1;
            *entry
        };

        let active = self.tally.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.tally.peak.fetch_max(active, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.tally.active.fetch_sub(1, Ordering::SeqCst);

        if call <= self.fail_first {
            return Err(NodeError::TransientIo(format!("flaky call {}", call)));
        }
        if let Some(message) = &self.fail {
            return Err(NodeError::ExecutionFailed(message.clone()));
        }

        let mut output = NodeOutput {
            outputs: ctx.inputs.clone(),
            ..NodeOutput::default()
        }
        .with_output("from", ctx.node_id.clone());
        if let Some(v) = ctx.config.get("publish") {
            output = output.with_variable(ctx.node_id.clone(), v.clone());
        }
        Ok(output)
    }
}

fn registry(tally: Arc<Tally>) -> Arc<NodeRegistry> {
    let mut registry = NodeRegistry::new();
    let schema = ConfigSchema::new()
        .optional("delay_ms", FieldType::Number)
        .optional("fail_first", FieldType::Number)
        .optional("fail", FieldType::String);
    registry
        .register_fn("test.scripted", schema, move |config| {
            let number = |key: &str| config.get(key).and_then(|v| v.as_f64()).unwrap_or(0.0);
            let node: Arc<dyn Node> = Arc::new(Scripted {
                tally: tally.clone(),
                delay: Duration::from_millis(number("delay_ms") as u64),
                fail_first: number("fail_first") as u32,
                fail: config.get("fail").and_then(|v| v.as_str()).map(str::to_string),
            });
            Ok(node)
        })
        .unwrap();
    Arc::new(registry)
}

fn engine(tally: &Arc<Tally>) -> Engine {
    Engine::new(registry(tally.clone()), EngineConfig::default()).unwrap()
}

fn scripted(id: &str) -> NodeSpec {
    NodeSpec::new(id, "test.scripted")
}

fn reason(result: Option<&NodeResult>) -> Option<String> {
    match result {
        Some(NodeResult::Skipped { reason }) => Some(reason.clone()),
        _ => None,
    }
}

#[tokio::test]
async fn inputs_flow_along_connections() {
    let tally = Arc::new(Tally::default());
    let engine = engine(&tally);
    let workflow = WorkflowDefinition::new("chain")
        .with_node(scripted("a").with_config("publish", "seen"))
        .with_node(scripted("b"))
        .with_connection("a", "from", "b", "upstream");
    let payload = HashMap::from([("order".to_string(), Value::from(42.0))]);

    let status = engine.execute(workflow, payload).await.unwrap();
    assert_eq!(status.state, RunState::Succeeded);

    let a = status.result("a").and_then(NodeResult::output).unwrap();
    assert_eq!(a.get("order"), Some(&Value::from(42.0)));
    let b = status.result("b").and_then(NodeResult::output).unwrap();
    assert_eq!(b.get("upstream"), Some(&Value::from("a")));
    assert!(b.get("order").is_none());
    assert_eq!(status.variables.get("a"), Some(&Value::from("seen")));
}

#[tokio::test]
async fn continue_siblings_skips_only_descendants() {
    let tally = Arc::new(Tally::default());
    let engine = engine(&tally);
    let workflow = WorkflowDefinition::new("branches")
        .with_node(scripted("a"))
        .with_node(scripted("b").with_config("fail", "boom").on_error(ErrorMode::ContinueSiblings))
        .with_node(scripted("c"))
        .with_node(scripted("d"))
        .with_connection("a", "from", "b", "in")
        .with_connection("a", "from", "c", "in")
        .with_connection("b", "from", "d", "in");

    let status = engine.execute(workflow, HashMap::new()).await.unwrap();
    assert!(status.result("a").unwrap().is_success());
    assert_eq!(status.result("b").unwrap().error_kind(), Some(ErrorKind::Fatal));
    assert!(status.result("c").unwrap().is_success());
    assert_eq!(reason(status.result("d")).as_deref(), Some("upstream node 'b' failed"));
    assert_eq!(tally.calls("d"), 0);
    assert_eq!(status.state, RunState::Succeeded);
}

#[tokio::test]
async fn halt_stops_dispatching_and_fails_the_run() {
    let tally = Arc::new(Tally::default());
    let engine = engine(&tally);
    let workflow = WorkflowDefinition::new("halt")
        .with_node(scripted("a").with_config("fail", "bad input"))
        .with_node(scripted("b"))
        .with_connection("a", "from", "b", "in");

    let status = engine.execute(workflow, HashMap::new()).await.unwrap();
    assert_eq!(status.state, RunState::Failed);
    match status.result("a") {
        Some(NodeResult::Failed { kind, message }) => {
            assert_eq!(*kind, ErrorKind::Fatal);
            assert!(message.contains("bad input"));
        }
        other => panic!("unexpected result {:?}", other),
    }
    assert_eq!(reason(status.result("b")).as_deref(), Some("run halted: node 'a' failed"));
    assert_eq!(tally.calls("b"), 0);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried_with_backoff() {
    let tally = Arc::new(Tally::default());
    let engine = engine(&tally);
    let mut events = engine.subscribe_events();
    let workflow = WorkflowDefinition::new("retry").with_node(
        scripted("flaky")
            .with_config("fail_first", 2.0)
            .with_retry(RetryPolicy::exponential(3, 1000, 2.0)),
    );

    let status = engine.execute(workflow, HashMap::new()).await.unwrap();
    assert_eq!(status.state, RunState::Succeeded);
    assert_eq!(tally.calls("flaky"), 3);

    let mut delays = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ExecutionEvent::NodeRetrying { attempt, delay_ms, .. } = event {
            delays.push((attempt, delay_ms));
        }
    }
    assert_eq!(delays, vec![(2, 1000), (3, 2000)]);
}

#[tokio::test(start_paused = true)]
async fn retries_stop_at_max_attempts() {
    let tally = Arc::new(Tally::default());
    let engine = engine(&tally);
    let workflow = WorkflowDefinition::new("exhausted").with_node(
        scripted("flaky")
            .with_config("fail_first", 10.0)
            .with_retry(RetryPolicy::exponential(2, 100, 2.0)),
    );

    let status = engine.execute(workflow, HashMap::new()).await.unwrap();
    assert_eq!(tally.calls("flaky"), 2);
    assert_eq!(status.result("flaky").unwrap().error_kind(), Some(ErrorKind::TransientIo));
    assert_eq!(status.state, RunState::Failed);
}

#[tokio::test(start_paused = true)]
async fn node_timeout_is_reported_as_timeout() {
    let tally = Arc::new(Tally::default());
    let engine = engine(&tally);
    let workflow = WorkflowDefinition::new("slow")
        .with_node(scripted("slow").with_config("delay_ms", 10_000.0).with_timeout_ms(500));

    let status = engine.execute(workflow, HashMap::new()).await.unwrap();
    assert_eq!(status.result("slow").unwrap().error_kind(), Some(ErrorKind::Timeout));
    assert_eq!(status.state, RunState::Failed);
}

#[tokio::test(start_paused = true)]
async fn parallelism_never_exceeds_the_bound() {
    let tally = Arc::new(Tally::default());
    let config = EngineConfig {
        max_parallel_nodes: 2,
        ..EngineConfig::default()
    };
    let engine = Engine::new(registry(tally.clone()), config).unwrap();
    let mut workflow = WorkflowDefinition::new("wide");
    for i in 0..6 {
        workflow.add_node(scripted(&format!("n{}", i)).with_config("delay_ms", 100.0));
    }

    let status = engine.execute(workflow, HashMap::new()).await.unwrap();
    assert_eq!(status.state, RunState::Succeeded);
    assert_eq!(tally.peak.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn workflow_setting_overrides_parallelism() {
    let tally = Arc::new(Tally::default());
    let engine = engine(&tally);
    let mut workflow = WorkflowDefinition::new("serial");
    workflow.settings.max_parallel_nodes = Some(1);
    for i in 0..3 {
        workflow.add_node(scripted(&format!("n{}", i)).with_config("delay_ms", 50.0));
    }

    engine.execute(workflow, HashMap::new()).await.unwrap();
    assert_eq!(tally.peak.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn cancel_skips_in_flight_and_pending_nodes() {
    let tally = Arc::new(Tally::default());
    let engine = engine(&tally);
    let workflow = WorkflowDefinition::new("cancel")
        .with_node(scripted("slow").with_config("delay_ms", 60_000.0))
        .with_node(scripted("next"))
        .with_connection("slow", "from", "next", "in");

    let run_id = engine.submit(workflow, HashMap::new()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    engine.cancel(run_id).await.unwrap();

    let status = engine.wait(run_id).await.unwrap();
    assert_eq!(status.state, RunState::Cancelled);
    assert_eq!(reason(status.result("slow")).as_deref(), Some("cancelled"));
    assert_eq!(reason(status.result("next")).as_deref(), Some("run cancelled"));
    assert!(status.log.iter().any(|entry| entry.message == "run cancelled"));
}

#[tokio::test(start_paused = true)]
async fn run_timeout_cancels_the_run() {
    let tally = Arc::new(Tally::default());
    let engine = engine(&tally);
    let mut workflow = WorkflowDefinition::new("deadline")
        .with_node(scripted("slow").with_config("delay_ms", 60_000.0));
    workflow.settings.max_execution_time_ms = Some(1_000);

    let status = engine.execute(workflow, HashMap::new()).await.unwrap();
    assert_eq!(status.state, RunState::Cancelled);
    assert!(status.result("slow").unwrap().is_skipped());
    assert!(status.log.iter().any(|entry| entry.message == "run timeout elapsed"));
}

#[tokio::test]
async fn cycles_are_rejected_before_execution() {
    let tally = Arc::new(Tally::default());
    let engine = engine(&tally);
    let workflow = WorkflowDefinition::new("cycle")
        .with_node(scripted("a"))
        .with_node(scripted("b"))
        .with_connection("a", "from", "b", "in")
        .with_connection("b", "from", "a", "in");

    let err = engine.submit(workflow, HashMap::new()).await.unwrap_err();
    assert!(matches!(err, FlowError::Workflow(WorkflowError::CyclicDependency { .. })));
    assert!(engine.runs().await.is_empty());
    assert_eq!(tally.calls("a"), 0);
}

#[tokio::test]
async fn unknown_types_and_bad_config_are_rejected_at_submit() {
    let tally = Arc::new(Tally::default());
    let engine = engine(&tally);

    let unknown = WorkflowDefinition::new("unknown").with_node(NodeSpec::new("x", "nope.missing"));
    assert!(matches!(
        engine.submit(unknown, HashMap::new()).await,
        Err(FlowError::Validation(_))
    ));

    let bad = WorkflowDefinition::new("bad").with_node(scripted("x").with_config("delay_ms", "soon"));
    assert!(matches!(
        engine.submit(bad, HashMap::new()).await,
        Err(FlowError::Validation(_))
    ));
}

#[tokio::test]
async fn isolated_nodes_need_a_worker_program() {
    let tally = Arc::new(Tally::default());
    let engine = engine(&tally);
    let workflow = WorkflowDefinition::new("isolated").with_node(scripted("x").isolated());

    assert!(matches!(
        engine.submit(workflow, HashMap::new()).await,
        Err(FlowError::Validation(_))
    ));
}

#[tokio::test]
async fn unknown_run_ids_are_not_found() {
    let tally = Arc::new(Tally::default());
    let engine = engine(&tally);
    let missing = Uuid::new_v4();

    assert!(matches!(engine.status(missing).await, Err(FlowError::RunNotFound(id)) if id == missing));
    assert!(matches!(engine.cancel(missing).await, Err(FlowError::RunNotFound(_))));
    assert!(matches!(engine.wait(missing).await, Err(FlowError::RunNotFound(_))));
}

#[tokio::test]
async fn resume_does_not_repeat_checkpointed_nodes() {
    let tally = Arc::new(Tally::default());
    let store = Arc::new(MemoryCheckpointStore::new());
    let engine = Engine::with_checkpoint_store(
        registry(tally.clone()),
        EngineConfig::default(),
        store.clone(),
    )
    .unwrap();
    let workflow = WorkflowDefinition::new("resume")
        .with_node(scripted("a"))
        .with_node(scripted("b"))
        .with_connection("a", "from", "b", "upstream");

    // A run that was interrupted right after `a` was checkpointed
    let run_id = Uuid::new_v4();
    let recorded = HashMap::from([("from".to_string(), Value::from("a (recorded)"))]);
    store
        .append(&Checkpoint::new(run_id, "a", NodeResult::success(recorded), HashMap::new()))
        .await
        .unwrap();

    engine.resume(workflow.clone(), run_id, HashMap::new()).await.unwrap();
    let status = engine.wait(run_id).await.unwrap();
    assert_eq!(status.state, RunState::Succeeded);
    assert_eq!(tally.calls("a"), 0);
    assert_eq!(tally.calls("b"), 1);
    assert_eq!(
        status.result("b").and_then(NodeResult::output).and_then(|o| o.get("upstream")),
        Some(&Value::from("a (recorded)"))
    );

    // Resuming a finished run replays every result and runs nothing
    engine.resume(workflow, run_id, HashMap::new()).await.unwrap();
    let replayed = engine.wait(run_id).await.unwrap();
    assert_eq!(replayed.state, RunState::Succeeded);
    assert_eq!(tally.calls("a"), 0);
    assert_eq!(tally.calls("b"), 1);
    assert_eq!(store.load(run_id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn resume_preserves_a_recorded_halt() {
    let tally = Arc::new(Tally::default());
    let store = Arc::new(MemoryCheckpointStore::new());
    let engine = Engine::with_checkpoint_store(
        registry(tally.clone()),
        EngineConfig::default(),
        store.clone(),
    )
    .unwrap();
    let workflow = WorkflowDefinition::new("halted")
        .with_node(scripted("a"))
        .with_node(scripted("b"))
        .with_connection("a", "from", "b", "in");

    let run_id = Uuid::new_v4();
    let failure = NodeResult::failed(&NodeError::ExecutionFailed("earlier".into()));
    store
        .append(&Checkpoint::new(run_id, "a", failure, HashMap::new()))
        .await
        .unwrap();

    engine.resume(workflow, run_id, HashMap::new()).await.unwrap();
    let status = engine.wait(run_id).await.unwrap();
    assert_eq!(status.state, RunState::Failed);
    assert_eq!(tally.calls("a"), 0);
    assert_eq!(tally.calls("b"), 0);
    assert_eq!(reason(status.result("b")).as_deref(), Some("run halted: node 'a' failed"));
}

#[tokio::test]
async fn status_reports_lifecycle_and_log() {
    let tally = Arc::new(Tally::default());
    let engine = engine(&tally);
    let workflow = WorkflowDefinition::new("lifecycle").with_node(scripted("only"));

    let status = engine.execute(workflow, HashMap::new()).await.unwrap();
    assert!(status.started_at.is_some());
    assert!(status.finished_at.is_some());
    assert!(status.duration_ms().unwrap() >= 0);
    assert_eq!(status.log.first().map(|e| e.message.as_str()), Some("run started (1 nodes)"));
    assert_eq!(status.log.last().map(|e| e.message.as_str()), Some("run finished: succeeded"));
    assert!(status
        .log
        .iter()
        .any(|e| e.node_id.as_deref() == Some("only") && e.message == "completed"));
}

#[tokio::test(start_paused = true)]
async fn resume_after_cancel_matches_an_uninterrupted_run() {
    let workflow = WorkflowDefinition::new("interrupted")
        .with_node(scripted("a").with_config("publish", "first"))
        .with_node(scripted("b").with_config("delay_ms", 60_000.0))
        .with_node(scripted("c"))
        .with_connection("a", "from", "b", "in")
        .with_connection("b", "from", "c", "in");
    let payload = HashMap::from([("order".to_string(), Value::from(7.0))]);

    let tally = Arc::new(Tally::default());
    let store = Arc::new(MemoryCheckpointStore::new());
    let engine = Engine::with_checkpoint_store(
        registry(tally.clone()),
        EngineConfig::default(),
        store.clone(),
    )
    .unwrap();

    let run_id = engine.submit(workflow.clone(), payload.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(tally.calls("a"), 1);
    assert_eq!(tally.calls("b"), 1);
    engine.cancel(run_id).await.unwrap();
    assert_eq!(engine.wait(run_id).await.unwrap().state, RunState::Cancelled);
    assert_eq!(store.load(run_id).await.unwrap().len(), 1);

    engine.resume(workflow.clone(), run_id, payload.clone()).await.unwrap();
    let resumed = engine.wait(run_id).await.unwrap();
    assert_eq!(resumed.state, RunState::Succeeded);
    assert_eq!(tally.calls("a"), 1);
    assert_eq!(tally.calls("b"), 2);
    assert_eq!(tally.calls("c"), 1);

    let fresh_engine = Engine::new(registry(Arc::new(Tally::default())), EngineConfig::default()).unwrap();
    let fresh = fresh_engine.execute(workflow, payload).await.unwrap();
    assert_eq!(resumed.results, fresh.results);
    assert_eq!(resumed.variables, fresh.variables);
}

#[tokio::test]
async fn resume_skips_dependents_of_a_recorded_sibling_failure() {
    let tally = Arc::new(Tally::default());
    let store = Arc::new(MemoryCheckpointStore::new());
    let engine = Engine::with_checkpoint_store(
        registry(tally.clone()),
        EngineConfig::default(),
        store.clone(),
    )
    .unwrap();
    let workflow = WorkflowDefinition::new("branches")
        .with_node(scripted("a"))
        .with_node(scripted("b").on_error(ErrorMode::ContinueSiblings))
        .with_node(scripted("c"))
        .with_node(scripted("d"))
        .with_connection("a", "from", "b", "in")
        .with_connection("a", "from", "c", "in")
        .with_connection("b", "from", "d", "in");

    // Interrupted after `b` failed but before its dependents were settled
    let run_id = Uuid::new_v4();
    let done = HashMap::from([("from".to_string(), Value::from("a"))]);
    store
        .append(&Checkpoint::new(run_id, "a", NodeResult::success(done), HashMap::new()))
        .await
        .unwrap();
    let failure = NodeResult::failed(&NodeError::ExecutionFailed("boom".into()));
    store
        .append(&Checkpoint::new(run_id, "b", failure, HashMap::new()))
        .await
        .unwrap();

    engine.resume(workflow, run_id, HashMap::new()).await.unwrap();
    let status = engine.wait(run_id).await.unwrap();
    assert_eq!(status.state, RunState::Succeeded);
    assert_eq!(reason(status.result("d")).as_deref(), Some("upstream node 'b' failed"));
    assert!(status.result("c").unwrap().is_success());
    assert_eq!(tally.calls("a"), 0);
    assert_eq!(tally.calls("b"), 0);
    assert_eq!(tally.calls("c"), 1);
    assert_eq!(tally.calls("d"), 0);

    let recorded: Vec<String> = store
        .load(run_id)
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.node_id)
        .collect();
    assert_eq!(recorded.len(), 4);
    assert!(recorded.contains(&"d".to_string()));
}

/// Store whose writes always fail
struct FullDisk;

#[async_trait]
impl CheckpointStore for FullDisk {
    async fn append(&self, _checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        Err(CheckpointError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk full")))
    }

    async fn load(&self, _run_id: RunId) -> Result<Vec<Checkpoint>, CheckpointError> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn checkpoint_write_failure_aborts_the_run() {
    let tally = Arc::new(Tally::default());
    let engine = Engine::with_checkpoint_store(
        registry(tally.clone()),
        EngineConfig::default(),
        Arc::new(FullDisk),
    )
    .unwrap();
    let workflow = WorkflowDefinition::new("unwritable")
        .with_node(scripted("a"))
        .with_node(scripted("b"))
        .with_connection("a", "from", "b", "in");

    let status = engine.execute(workflow, HashMap::new()).await.unwrap();
    assert_eq!(status.state, RunState::Failed);
    assert_eq!(tally.calls("b"), 0);
    let skipped = reason(status.result("b")).unwrap();
    assert!(skipped.starts_with("run aborted: checkpoint write failed:"));
    assert!(skipped.contains("disk full"));
}

async fn settle(engine: &Engine) {
    while !engine.active_runs().await.is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn finished_runs_are_released_and_bounded() {
    let tally = Arc::new(Tally::default());
    let config = EngineConfig {
        retained_runs: 2,
        ..EngineConfig::default()
    };
    let engine = Engine::new(registry(tally.clone()), config).unwrap();

    let mut ids = Vec::new();
    for i in 0..4 {
        let workflow = WorkflowDefinition::new(format!("run-{}", i)).with_node(scripted("only"));
        ids.push(engine.execute(workflow, HashMap::new()).await.unwrap().run_id);
    }
    settle(&engine).await;

    assert_eq!(engine.runs().await.len(), 2);
    assert!(matches!(engine.status(ids[0]).await, Err(FlowError::RunNotFound(_))));
    assert!(matches!(engine.wait(ids[1]).await, Err(FlowError::RunNotFound(_))));

    let latest = engine.status(ids[3]).await.unwrap();
    assert_eq!(latest.state, RunState::Succeeded);
    assert!(latest.result("only").unwrap().is_success());
    assert_eq!(engine.wait(ids[2]).await.unwrap().state, RunState::Succeeded);
    engine.cancel(ids[3]).await.unwrap();
    assert_eq!(engine.status(ids[3]).await.unwrap().state, RunState::Succeeded);
}

#[tokio::test(start_paused = true)]
async fn concurrent_resumes_of_one_run_start_it_once() {
    let tally = Arc::new(Tally::default());
    let engine = engine(&tally);
    let workflow = WorkflowDefinition::new("contended")
        .with_node(scripted("slow").with_config("delay_ms", 1_000.0));
    let run_id = Uuid::new_v4();

    let (first, second) = tokio::join!(
        engine.resume(workflow.clone(), run_id, HashMap::new()),
        engine.resume(workflow, run_id, HashMap::new()),
    );
    let started = [&first, &second].iter().filter(|r| r.is_ok()).count();
    assert_eq!(started, 1);
    let rejected = first.err().or(second.err()).unwrap();
    assert!(rejected.to_string().contains("still active"));

    assert_eq!(engine.wait(run_id).await.unwrap().state, RunState::Succeeded);
    assert_eq!(tally.calls("slow"), 1);
}
