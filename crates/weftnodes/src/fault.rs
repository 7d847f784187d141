//! Fault-injection nodes for exercising retries, error modes and isolation.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use weftcore::{Node, NodeContext, NodeError, NodeOutput, Value};
use weftruntime::{ConfigSchema, FieldType, NodeFactory, NodeMetadata};

const FAILURE_KINDS: [&str; 4] = ["fatal", "transient", "timeout", "validation"];

fn failure(kind: &str, message: &str) -> NodeError {
    match kind {
        "transient" => NodeError::TransientIo(message.to_string()),
        "timeout" => NodeError::Timeout { millis: 0 },
        "validation" => NodeError::Configuration(message.to_string()),
        _ => NodeError::ExecutionFailed(message.to_string()),
    }
}

fn string_config(config: &HashMap<String, Value>, key: &str, default: &str) -> String {
    config
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or(default)
        .to_string()
}

/// Always fails with the configured error kind
pub struct FailNode {
    kind: String,
    message: String,
}

#[async_trait]
impl Node for FailNode {
    fn node_type(&self) -> &str {
        "debug.fail"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        ctx.events.warn(format!("failing on purpose ({})", self.kind));
        Err(failure(&self.kind, &self.message))
    }
}

pub struct FailNodeFactory;

impl NodeFactory for FailNodeFactory {
    fn create(&self, config: &HashMap<String, Value>) -> Result<Arc<dyn Node>, NodeError> {
        Ok(Arc::new(FailNode {
            kind: string_config(config, "kind", "fatal"),
            message: string_config(config, "message", "injected failure"),
        }))
    }

    fn node_type(&self) -> &str {
        "debug.fail"
    }

    fn schema(&self) -> ConfigSchema {
        ConfigSchema::new()
            .optional("kind", FieldType::String)
            .one_of("kind", FAILURE_KINDS)
            .optional("message", FieldType::String)
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Fails with a configured error kind".to_string(),
            category: "debug".to_string(),
            inputs: vec![],
            outputs: vec![],
        }
    }
}

/// Fails transiently for the first `fail_times` attempts of a run, then
/// passes its inputs through
pub struct FlakyNode {
    fail_times: u32,
    attempts: AtomicU32,
}

#[async_trait]
impl Node for FlakyNode {
    fn node_type(&self) -> &str {
        "debug.flaky"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let seen = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if seen <= self.fail_times {
            return Err(NodeError::TransientIo(format!(
                "flaky failure {} of {}",
                seen, self.fail_times
            )));
        }
        Ok(NodeOutput {
            outputs: ctx.inputs,
            ..NodeOutput::default()
        }
        .with_output("attempts", seen as f64))
    }
}

pub struct FlakyNodeFactory;

impl NodeFactory for FlakyNodeFactory {
    fn create(&self, config: &HashMap<String, Value>) -> Result<Arc<dyn Node>, NodeError> {
        let fail_times = config.get("fail_times").and_then(|v| v.as_f64()).unwrap_or(1.0);
        Ok(Arc::new(FlakyNode {
            fail_times: fail_times.max(0.0) as u32,
            attempts: AtomicU32::new(0),
        }))
    }

    fn node_type(&self) -> &str {
        "debug.flaky"
    }

    fn schema(&self) -> ConfigSchema {
        ConfigSchema::new().optional("fail_times", FieldType::Number)
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Fails transiently a fixed number of times".to_string(),
            category: "debug".to_string(),
            inputs: vec![],
            outputs: vec![],
        }
    }
}

/// Terminates the hosting process. Only ever runs inside a worker.
pub struct CrashNode {
    mode: String,
}

#[async_trait]
impl Node for CrashNode {
    fn node_type(&self) -> &str {
        "debug.crash"
    }

    async fn execute(&self, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        tracing::error!(mode = %self.mode, "crashing worker on request");
        match self.mode.as_str() {
            "exit" => std::process::exit(3),
            _ => std::process::abort(),
        }
    }
}

pub struct CrashNodeFactory;

impl NodeFactory for CrashNodeFactory {
    fn create(&self, config: &HashMap<String, Value>) -> Result<Arc<dyn Node>, NodeError> {
        Ok(Arc::new(CrashNode {
            mode: string_config(config, "mode", "abort"),
        }))
    }

    fn node_type(&self) -> &str {
        "debug.crash"
    }

    fn schema(&self) -> ConfigSchema {
        ConfigSchema::new()
            .optional("mode", FieldType::String)
            .one_of("mode", ["abort", "exit"])
    }

    fn requires_isolation(&self) -> bool {
        true
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Kills its worker process".to_string(),
            category: "debug".to_string(),
            inputs: vec![],
            outputs: vec![],
        }
    }
}

/// Allocates and touches `bytes` of memory, burns `spin_ms` of CPU, then
/// holds the memory for `hold_ms`
pub struct HogNode {
    bytes: usize,
    spin: Duration,
    hold: Duration,
}

fn spin_for(duration: Duration) {
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        std::hint::spin_loop();
    }
}

#[async_trait]
impl Node for HogNode {
    fn node_type(&self) -> &str {
        "debug.hog"
    }

    async fn execute(&self, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let block = vec![1u8; self.bytes];
        if !self.spin.is_zero() {
            let spin = self.spin;
            tokio::task::spawn_blocking(move || spin_for(spin))
                .await
                .map_err(|e| NodeError::ExecutionFailed(format!("spin task failed: {}", e)))?;
        }
        tokio::time::sleep(self.hold).await;
        Ok(NodeOutput::new().with_output("bytes", block.iter().map(|b| *b as f64).sum::<f64>()))
    }
}

pub struct HogNodeFactory;

impl NodeFactory for HogNodeFactory {
    fn create(&self, config: &HashMap<String, Value>) -> Result<Arc<dyn Node>, NodeError> {
        let bytes = config.get("bytes").and_then(|v| v.as_f64()).unwrap_or(0.0);
        let spin_ms = config.get("spin_ms").and_then(|v| v.as_f64()).unwrap_or(0.0);
        let hold_ms = config.get("hold_ms").and_then(|v| v.as_f64()).unwrap_or(0.0);
        Ok(Arc::new(HogNode {
            bytes: bytes.max(0.0) as usize,
            spin: Duration::from_millis(spin_ms.max(0.0) as u64),
            hold: Duration::from_millis(hold_ms.max(0.0) as u64),
        }))
    }

    fn node_type(&self) -> &str {
        "debug.hog"
    }

    fn schema(&self) -> ConfigSchema {
        ConfigSchema::new()
            .required("bytes", FieldType::Number)
            .optional("spin_ms", FieldType::Number)
            .optional("hold_ms", FieldType::Number)
    }

    fn requires_isolation(&self) -> bool {
        true
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Holds a block of memory and burns CPU".to_string(),
            category: "debug".to_string(),
            inputs: vec![],
            outputs: vec![],
        }
    }
}
