use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use weftcore::{Node, NodeContext, NodeError, NodeOutput, Value};
use weftruntime::{ConfigSchema, FieldType, NodeFactory, NodeMetadata, PortDefinition};

/// Simple debug node that logs its inputs
pub struct DebugNode {
    /// Publish the message under this run variable when set
    publish_as: Option<String>,
}

#[async_trait]
impl Node for DebugNode {
    fn node_type(&self) -> &str {
        "debug.log"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let message = ctx
            .inputs
            .get("message")
            .and_then(|v| v.as_str())
            .or_else(|| ctx.config.get("message").and_then(|v| v.as_str()))
            .unwrap_or("(no message)")
            .to_string();

        tracing::info!(run_id = %ctx.run_id, node_id = %ctx.node_id, "{}", message);
        ctx.events.info(format!("DEBUG: {}", message));

        let mut keys: Vec<&String> = ctx.inputs.keys().collect();
        keys.sort();
        for key in keys {
            ctx.events.info(format!("  {}: {:?}", key, ctx.inputs[key]));
        }

        let mut output = NodeOutput::new().with_output("message", message.clone());
        if let Some(name) = &self.publish_as {
            output = output.with_variable(name.clone(), message);
        }
        Ok(output)
    }
}

pub struct DebugNodeFactory;

impl NodeFactory for DebugNodeFactory {
    fn create(&self, config: &HashMap<String, Value>) -> Result<Arc<dyn Node>, NodeError> {
        Ok(Arc::new(DebugNode {
            publish_as: config.get("publish_as").and_then(|v| v.as_str()).map(str::to_string),
        }))
    }

    fn node_type(&self) -> &str {
        "debug.log"
    }

    fn schema(&self) -> ConfigSchema {
        ConfigSchema::new()
            .optional("message", FieldType::String)
            .describe("message", "Fallback when no message input is bound")
            .optional("publish_as", FieldType::String)
            .describe("publish_as", "Run variable that receives the message")
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Logs input values for debugging".to_string(),
            category: "debug".to_string(),
            inputs: vec![PortDefinition::new("message", "Text to log", false)],
            outputs: vec![PortDefinition::new("message", "The logged text", true)],
        }
    }
}
