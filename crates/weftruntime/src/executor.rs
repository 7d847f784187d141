use crate::isolation::{ExecuteRequest, IsolationChannel};
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use weftcore::{EventBus, Node, NodeContext, NodeError, NodeId, NodeOutput, RunId, Value};

/// Everything one node attempt needs besides the instance itself
#[derive(Debug, Clone)]
pub struct NodeInvocation {
    pub run_id: RunId,
    pub node_id: NodeId,
    pub node_type: String,
    pub attempt: u32,
    pub config: HashMap<String, Value>,
    pub inputs: HashMap<String, Value>,
    pub variables: HashMap<String, Value>,
    pub timeout: Duration,
    pub isolated: bool,
}

/// Runs a single node attempt, in process or through the isolation channel
pub struct NodeExecutor {
    events: Arc<EventBus>,
    isolation: Option<Arc<IsolationChannel>>,
}

impl NodeExecutor {
    pub fn new(events: Arc<EventBus>, isolation: Option<Arc<IsolationChannel>>) -> Self {
        Self { events, isolation }
    }

    pub fn supports_isolation(&self) -> bool {
        self.isolation.is_some()
    }

    pub async fn execute(
        &self,
        node: &Arc<dyn Node>,
        invocation: NodeInvocation,
        cancellation: &CancellationToken,
    ) -> Result<NodeOutput, NodeError> {
        let started = Instant::now();
        let isolated = invocation.isolated;
        let attempt = invocation.attempt;

        let result = if isolated {
            let channel = self.isolation.as_ref().ok_or_else(|| {
                NodeError::IsolationFault("no isolation channel configured".into())
            })?;
            let timeout = invocation.timeout;
            channel
                .execute(isolation_request(invocation), timeout, cancellation)
                .await
        } else {
            let timeout = invocation.timeout;
            let mut ctx = NodeContext::new(
                invocation.run_id,
                invocation.node_id.clone(),
                self.events.create_emitter(invocation.run_id, invocation.node_id),
            );
            ctx.attempt = invocation.attempt;
            ctx.inputs = invocation.inputs;
            ctx.config = invocation.config;
            ctx.variables = invocation.variables;
            ctx.cancellation = cancellation.clone();
            run_in_process(node.clone(), ctx, timeout).await
        };

        result.map(|mut output| {
            output.metadata.execution_time_ms = started.elapsed().as_millis() as u64;
            output.metadata.attempts = attempt;
            output.metadata.isolated = isolated;
            output
        })
    }
}

fn isolation_request(invocation: NodeInvocation) -> ExecuteRequest {
    ExecuteRequest {
        run_id: invocation.run_id,
        node_id: invocation.node_id,
        node_type: invocation.node_type,
        attempt: invocation.attempt,
        config: invocation.config,
        inputs: invocation.inputs,
        variables: invocation.variables,
        deadline_ms: invocation.timeout.as_millis() as u64,
    }
}

/// Race a node's logic against its deadline and the context's cancellation
/// token. A panic inside the node is reported as a fatal error.
pub async fn run_in_process(
    node: Arc<dyn Node>,
    ctx: NodeContext,
    timeout: Duration,
) -> Result<NodeOutput, NodeError> {
    let cancellation = ctx.cancellation.clone();
    let invocation = AssertUnwindSafe(async move { node.execute(ctx).await }).catch_unwind();

    tokio::select! {
        _ = cancellation.cancelled() => Err(NodeError::Cancelled),
        _ = tokio::time::sleep(timeout) => Err(NodeError::Timeout {
            millis: timeout.as_millis() as u64,
        }),
        result = invocation => match result {
            Ok(result) => result,
            Err(panic) => Err(NodeError::ExecutionFailed(format!(
                "node panicked: {}",
                panic_message(panic.as_ref())
            ))),
        },
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
