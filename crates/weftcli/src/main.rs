use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;
use weftcore::{
    ErrorMode, ExecutionEvent, NodeEvent, NodeResult, NodeSpec, RetryPolicy, RunId, RunState,
    Value, WorkflowDefinition,
};
use weftruntime::{
    CheckpointStore, DependencyGraph, Engine, EngineConfig, FileCheckpointStore,
    MemoryCheckpointStore, NodeRegistry, RunStatus,
};

#[derive(Parser)]
#[command(name = "weft")]
#[command(about = "Weft workflow engine CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow file
    Run {
        /// Path to workflow JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Run payload as a JSON object
        #[arg(short, long)]
        input: Option<String>,

        /// Engine configuration JSON file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Directory for durable checkpoints; enables `resume`
        #[arg(long)]
        checkpoint_dir: Option<PathBuf>,

        /// Show debug output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Continue an interrupted run from its checkpoints
    Resume {
        /// Path to the workflow JSON file the run was started with
        #[arg(short, long)]
        file: PathBuf,

        #[arg(long)]
        run_id: RunId,

        #[arg(long)]
        checkpoint_dir: PathBuf,

        /// Run payload as a JSON object
        #[arg(short, long)]
        input: Option<String>,

        #[arg(short, long)]
        config: Option<PathBuf>,

        #[arg(short, long)]
        verbose: bool,
    },

    /// Check a workflow for cycles and invalid node configuration
    Validate {
        /// Path to workflow JSON file
        file: PathBuf,
    },

    /// List available node types
    Nodes,

    /// Create a new example workflow
    Init {
        /// Output file path
        #[arg(short, long, default_value = "workflow.json")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            input,
            config,
            checkpoint_dir,
            verbose,
        } => {
            init_tracing(verbose);
            let engine = build_engine(config.as_deref(), checkpoint_dir.as_deref()).await?;
            let workflow = load_workflow(&file)?;
            let payload = parse_payload(input.as_deref())?;
            let events = engine.subscribe_events();
            let run_id = engine.submit(workflow, payload).await?;
            follow_run(&engine, run_id, events).await?;
        }

        Commands::Resume {
            file,
            run_id,
            checkpoint_dir,
            input,
            config,
            verbose,
        } => {
            init_tracing(verbose);
            let engine = build_engine(config.as_deref(), Some(&checkpoint_dir)).await?;
            let workflow = load_workflow(&file)?;
            let payload = parse_payload(input.as_deref())?;
            let events = engine.subscribe_events();
            engine.resume(workflow, run_id, payload).await?;
            follow_run(&engine, run_id, events).await?;
        }

        Commands::Validate { file } => {
            init_tracing(false);
            validate_workflow(&file)?;
        }

        Commands::Nodes => {
            list_nodes()?;
        }

        Commands::Init { output } => {
            create_example_workflow(&output)?;
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_writer(std::io::stderr)
        .init();
}

fn registry() -> Result<NodeRegistry> {
    weftnodes::standard_registry().context("failed to register standard nodes")
}

/// The worker binary ships next to `weft`; use it unless the config names one
fn default_worker() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let worker = exe.with_file_name(format!("weft-worker{}", std::env::consts::EXE_SUFFIX));
    worker.exists().then_some(worker)
}

async fn build_engine(config: Option<&Path>, checkpoint_dir: Option<&Path>) -> Result<Engine> {
    let mut config = match config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("failed to load engine config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if config.isolation.worker_program.is_none() {
        config.isolation.worker_program = default_worker();
    }

    let checkpoints: Arc<dyn CheckpointStore> = match checkpoint_dir {
        Some(dir) => Arc::new(
            FileCheckpointStore::open(dir)
                .await
                .with_context(|| format!("failed to open checkpoint dir {}", dir.display()))?,
        ),
        None => Arc::new(MemoryCheckpointStore::new()),
    };

    Ok(Engine::with_checkpoint_store(Arc::new(registry()?), config, checkpoints)?)
}

fn load_workflow(file: &Path) -> Result<WorkflowDefinition> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let workflow: WorkflowDefinition = serde_json::from_str(&text)
        .with_context(|| format!("invalid workflow file {}", file.display()))?;
    tracing::debug!(
        workflow = %workflow.name,
        nodes = workflow.nodes.len(),
        connections = workflow.connections.len(),
        "loaded workflow"
    );
    Ok(workflow)
}

fn parse_payload(input: Option<&str>) -> Result<HashMap<String, Value>> {
    let Some(input) = input else {
        return Ok(HashMap::new());
    };
    let json: serde_json::Value = serde_json::from_str(input).context("input is not valid JSON")?;
    match Value::from_plain_json(json) {
        Value::Object(map) => Ok(map),
        _ => bail!("input must be a JSON object"),
    }
}

/// Print events for one run until it finishes, then print its summary
async fn follow_run(
    engine: &Engine,
    run_id: RunId,
    mut events: broadcast::Receiver<ExecutionEvent>,
) -> Result<()> {
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if event.run_id() != run_id {
                continue;
            }
            match event {
                ExecutionEvent::RunStarted { resumed_nodes, .. } => {
                    if resumed_nodes > 0 {
                        println!("run {} resumed ({} nodes from checkpoints)", run_id, resumed_nodes);
                    } else {
                        println!("run {} started", run_id);
                    }
                }
                ExecutionEvent::NodeStarted { node_id, node_type, .. } => {
                    println!("  > {} ({})", node_id, node_type);
                }
                ExecutionEvent::NodeRetrying { node_id, attempt, delay_ms, error, .. } => {
                    println!("  ~ {} retrying in {}ms (attempt {}): {}", node_id, delay_ms, attempt, error);
                }
                ExecutionEvent::NodeCompleted { node_id, duration_ms, .. } => {
                    println!("  + {} completed in {}ms", node_id, duration_ms);
                }
                ExecutionEvent::NodeFailed { node_id, kind, error, .. } => {
                    println!("  x {} failed [{}]: {}", node_id, kind, error);
                }
                ExecutionEvent::NodeSkipped { node_id, reason, .. } => {
                    println!("  - {} skipped: {}", node_id, reason);
                }
                ExecutionEvent::NodeEvent { node_id, event, .. } => match event {
                    NodeEvent::Info { message } => println!("    [{}] {}", node_id, message),
                    NodeEvent::Warning { message } => println!("    [{}] warning: {}", node_id, message),
                    NodeEvent::Progress { percent, message } => match message {
                        Some(msg) => println!("    [{}] {:.0}% {}", node_id, percent, msg),
                        None => println!("    [{}] {:.0}%", node_id, percent),
                    },
                },
                ExecutionEvent::RunCompleted { .. } => break,
            }
        }
    });

    let status = tokio::select! {
        status = engine.wait(run_id) => status?,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("interrupt received, cancelling run {}", run_id);
            engine.cancel(run_id).await?;
            engine.wait(run_id).await?
        }
    };
    // Let the printer drain whatever the run emitted last
    let _ = tokio::time::timeout(std::time::Duration::from_millis(200), printer).await;

    print_summary(&status);
    if status.state != RunState::Succeeded {
        std::process::exit(1);
    }
    Ok(())
}

fn print_summary(status: &RunStatus) {
    println!();
    println!("Run {}: {}", status.run_id, status.state);
    if let Some(ms) = status.duration_ms() {
        println!("  duration: {}ms", ms);
    }

    let mut node_ids: Vec<&String> = status.results.keys().collect();
    node_ids.sort();
    for node_id in node_ids {
        match &status.results[node_id] {
            NodeResult::Success { output } => {
                println!("  {}: success", node_id);
                let mut ports: Vec<_> = output.iter().collect();
                ports.sort_by(|a, b| a.0.cmp(b.0));
                for (port, value) in ports {
                    println!("    {} = {}", port, value.to_plain_json());
                }
            }
            NodeResult::Failed { kind, message } => println!("  {}: failed [{}] {}", node_id, kind, message),
            NodeResult::Skipped { reason } => println!("  {}: skipped ({})", node_id, reason),
        }
    }

    if !status.variables.is_empty() {
        println!("  variables:");
        let mut names: Vec<_> = status.variables.iter().collect();
        names.sort_by(|a, b| a.0.cmp(b.0));
        for (name, value) in names {
            println!("    {} = {}", name, value.to_plain_json());
        }
    }
}

fn validate_workflow(file: &Path) -> Result<()> {
    let workflow = load_workflow(file)?;
    let graph = DependencyGraph::build(&workflow).context("workflow graph is invalid")?;
    let registry = registry()?;

    let mut problems = Vec::new();
    for node in &workflow.nodes {
        if let Err(e) = registry.validate(&node.node_type, &node.config) {
            problems.push(format!("{}: {}", node.id, e));
        }
    }
    if !problems.is_empty() {
        for problem in &problems {
            println!("  {}", problem);
        }
        bail!("{} node(s) failed validation", problems.len());
    }

    println!("Workflow '{}' is valid", workflow.name);
    println!("  nodes: {}", workflow.nodes.len());
    println!("  connections: {}", workflow.connections.len());
    println!("  execution layers:");
    for (depth, layer) in graph.layers().iter().enumerate() {
        println!("    {}: {}", depth, layer.join(", "));
    }
    Ok(())
}

fn list_nodes() -> Result<()> {
    let registry = registry()?;
    println!("Available node types:");
    println!();

    for node_type in registry.list_node_types() {
        let isolated = if registry.requires_isolation(&node_type) { " [isolated]" } else { "" };
        match registry.get_metadata(&node_type) {
            Some(metadata) => {
                println!("  {} ({}){}", node_type, metadata.category, isolated);
                println!("    {}", metadata.description);
            }
            None => println!("  {}{}", node_type, isolated),
        }
        if let Some(schema) = registry.get_schema(&node_type) {
            for field in schema.fields() {
                let required = if field.required { "required" } else { "optional" };
                println!("      {}: {} ({})", field.name, field.field_type.label(), required);
            }
        }
    }
    Ok(())
}

fn create_example_workflow(output: &Path) -> Result<()> {
    let mut workflow = WorkflowDefinition::new("Example HTTP Workflow");
    workflow.description = Some("Fetches a URL, retrying transient failures, and logs the body".to_string());

    let fetch = NodeSpec::new("fetch", "http.request")
        .with_name("Fetch Data")
        .with_config("method", "GET")
        .with_retry(RetryPolicy::exponential(3, 1000, 2.0))
        .with_timeout_ms(10_000);
    let log = NodeSpec::new("log", "debug.log")
        .with_name("Log Response")
        .on_error(ErrorMode::ContinueSiblings);

    let fetch_id = workflow.add_node(fetch);
    let log_id = workflow.add_node(log);
    workflow.connect(fetch_id, "body", log_id, "message");

    let json = serde_json::to_string_pretty(&workflow)?;
    std::fs::write(output, json).with_context(|| format!("failed to write {}", output.display()))?;

    println!("Created example workflow: {}", output.display());
    println!();
    println!("Run it with:");
    println!(
        "  weft run --file {} --input '{{\"url\": \"https://api.github.com/zen\"}}'",
        output.display()
    );
    Ok(())
}
