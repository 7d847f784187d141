use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use weftcore::{Node, NodeContext, NodeError, NodeOutput, Value};
use weftruntime::{ConfigSchema, FieldType, NodeFactory, NodeMetadata, PortDefinition};

/// HTTP request node
pub struct HttpRequestNode {
    client: reqwest::Client,
    method: String,
    headers: HashMap<String, String>,
}

impl HttpRequestNode {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            method: method.into(),
            headers: HashMap::new(),
        }
    }
}

/// Connection problems and 5xx/429 responses are worth retrying; anything
/// else is a fatal failure of this request.
fn classify(error: reqwest::Error) -> NodeError {
    if error.is_timeout() || error.is_connect() || error.is_request() {
        NodeError::TransientIo(format!("HTTP request failed: {}", error))
    } else {
        NodeError::ExecutionFailed(format!("HTTP request failed: {}", error))
    }
}

#[async_trait]
impl Node for HttpRequestNode {
    fn node_type(&self) -> &str {
        "http.request"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let url_value = ctx
            .inputs
            .get("url")
            .or_else(|| ctx.config.get("url"))
            .ok_or_else(|| NodeError::MissingInput("url".to_string()))?;
        let url = url_value.as_str().ok_or_else(|| NodeError::InvalidInputType {
            field: "url".to_string(),
            expected: "string".to_string(),
            actual: url_value.type_name().to_string(),
        })?;

        ctx.events.info(format!("{} {}", self.method, url));

        let mut request = match self.method.as_str() {
            "GET" => self.client.get(url),
            "POST" => self.client.post(url),
            "PUT" => self.client.put(url),
            "DELETE" => self.client.delete(url),
            other => return Err(NodeError::Configuration(format!("Unsupported method: {}", other))),
        };

        if let Some(body) = ctx.inputs.get("body") {
            request = match body {
                Value::String(text) => request.body(text.clone()),
                other => request.json(&other.to_plain_json()),
            };
        }
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }

        let response = request.send().await.map_err(classify)?;

        let status = response.status();
        let headers_map: HashMap<String, Value> = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_str().unwrap_or("").to_string())))
            .collect();

        let body_text = response.text().await.map_err(classify)?;

        ctx.events.info(format!("Response status: {}", status.as_u16()));

        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(NodeError::TransientIo(format!("{} returned {}", url, status)));
        }

        Ok(NodeOutput::new()
            .with_output("status", status.as_u16() as f64)
            .with_output("body", body_text)
            .with_output("headers", Value::Object(headers_map)))
    }
}

pub struct HttpRequestNodeFactory;

impl NodeFactory for HttpRequestNodeFactory {
    fn create(&self, config: &HashMap<String, Value>) -> Result<Arc<dyn Node>, NodeError> {
        let method = config
            .get("method")
            .and_then(|v| v.as_str())
            .unwrap_or("GET")
            .to_uppercase();
        let mut node = HttpRequestNode::new(method);

        let headers = match config.get("headers") {
            Some(Value::Object(map)) => map
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect(),
            Some(Value::Json(serde_json::Value::Object(map))) => map
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect(),
            _ => HashMap::new(),
        };
        node.headers = headers;
        Ok(Arc::new(node))
    }

    fn node_type(&self) -> &str {
        "http.request"
    }

    fn schema(&self) -> ConfigSchema {
        ConfigSchema::new()
            .optional("url", FieldType::String)
            .describe("url", "Used when no url input is bound")
            .optional("method", FieldType::String)
            .one_of("method", ["GET", "POST", "PUT", "DELETE"])
            .optional("headers", FieldType::Object)
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Make HTTP requests".to_string(),
            category: "http".to_string(),
            inputs: vec![
                PortDefinition::new("url", "Request URL", false),
                PortDefinition::new("body", "Request body", false),
            ],
            outputs: vec![
                PortDefinition::new("status", "Response status code", true),
                PortDefinition::new("body", "Response body text", true),
                PortDefinition::new("headers", "Response headers", true),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;
    use weftcore::{ErrorKind, EventEmitter};

    #[tokio::test]
    async fn missing_url_is_a_validation_error() {
        let node = HttpRequestNodeFactory.create(&HashMap::new()).unwrap();
        let run_id = Uuid::new_v4();
        let ctx = NodeContext::new(run_id, "h", EventEmitter::detached(run_id, "h".into()));
        let err = node.execute(ctx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn refused_connection_is_transient() {
        // Bind then drop a listener to get a port nobody is serving
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = HashMap::from([("url".to_string(), Value::from(format!("http://{}/", addr)))]);
        let node = HttpRequestNodeFactory.create(&config).unwrap();
        let run_id = Uuid::new_v4();
        let mut ctx = NodeContext::new(run_id, "h", EventEmitter::detached(run_id, "h".into()));
        ctx.config = config;
        let err = node.execute(ctx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransientIo);
    }
}
