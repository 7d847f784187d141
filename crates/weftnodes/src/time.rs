use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use weftcore::{Node, NodeContext, NodeError, NodeOutput, Value};
use weftruntime::{ConfigSchema, FieldType, NodeFactory, NodeMetadata};

/// Delay execution for a specified duration, then pass inputs through
pub struct DelayNode {
    delay: Duration,
}

#[async_trait]
impl Node for DelayNode {
    fn node_type(&self) -> &str {
        "time.delay"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        ctx.events.info(format!("Delaying for {}ms", self.delay.as_millis()));

        tokio::select! {
            _ = ctx.cancellation.cancelled() => return Err(NodeError::Cancelled),
            _ = sleep(self.delay) => {}
        }
        ctx.events.progress(100.0, None);

        Ok(NodeOutput {
            outputs: ctx.inputs,
            ..NodeOutput::default()
        })
    }
}

pub struct DelayNodeFactory;

impl NodeFactory for DelayNodeFactory {
    fn create(&self, config: &HashMap<String, Value>) -> Result<Arc<dyn Node>, NodeError> {
        let delay_ms = config.get("delay_ms").and_then(|v| v.as_f64()).unwrap_or(1000.0);
        if delay_ms < 0.0 {
            return Err(NodeError::Configuration("delay_ms must not be negative".into()));
        }
        Ok(Arc::new(DelayNode {
            delay: Duration::from_millis(delay_ms as u64),
        }))
    }

    fn node_type(&self) -> &str {
        "time.delay"
    }

    fn schema(&self) -> ConfigSchema {
        ConfigSchema::new()
            .optional("delay_ms", FieldType::Number)
            .describe("delay_ms", "Milliseconds to wait (default 1000)")
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Delay execution for specified milliseconds".to_string(),
            category: "time".to_string(),
            inputs: vec![],
            outputs: vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;
    use weftcore::EventEmitter;

    #[tokio::test(start_paused = true)]
    async fn passes_inputs_through_after_delay() {
        let node = DelayNodeFactory
            .create(&HashMap::from([("delay_ms".to_string(), Value::from(500.0))]))
            .unwrap();
        let run_id = Uuid::new_v4();
        let mut ctx = NodeContext::new(run_id, "d", EventEmitter::detached(run_id, "d".into()));
        ctx.inputs.insert("x".into(), Value::from(1.0));

        let started = tokio::time::Instant::now();
        let output = node.execute(ctx).await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_millis(500));
        assert_eq!(output.outputs.get("x"), Some(&Value::from(1.0)));
    }

    #[test]
    fn negative_delay_is_rejected() {
        let config = HashMap::from([("delay_ms".to_string(), Value::from(-1.0))]);
        assert!(DelayNodeFactory.create(&config).is_err());
    }
}
