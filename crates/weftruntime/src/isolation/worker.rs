//! Worker side of the isolation channel.

use super::protocol::{self, ExecuteRequest, ProtocolError, WorkerRequest, WorkerResponse, PROTOCOL_VERSION};
use crate::executor::run_in_process;
use crate::registry::NodeRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use weftcore::{EventEmitter, NodeContext, NodeError, NodeOutput};

/// Answer requests on `reader`/`writer` until the peer closes the stream.
/// Requests are handled one at a time.
pub async fn serve<R, W>(
    registry: Arc<NodeRegistry>,
    reader: R,
    writer: W,
    max_frame_bytes: usize,
) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = protocol::frame_reader(reader, max_frame_bytes);
    let mut writer = protocol::frame_writer(writer, max_frame_bytes);

    while let Some(request) = protocol::recv::<_, WorkerRequest>(&mut reader).await? {
        let response = match request {
            WorkerRequest::Handshake { protocol_version } => {
                if protocol_version != PROTOCOL_VERSION {
                    tracing::warn!(
                        expected = PROTOCOL_VERSION,
                        actual = protocol_version,
                        "engine speaks a different protocol version"
                    );
                }
                WorkerResponse::HandshakeAck {
                    protocol_version: PROTOCOL_VERSION,
                    node_types: registry.list_node_types(),
                }
            }
            WorkerRequest::Execute(request) => {
                tracing::debug!(
                    run_id = %request.run_id,
                    node_id = %request.node_id,
                    node_type = %request.node_type,
                    attempt = request.attempt,
                    "executing isolated node"
                );
                WorkerResponse::Result(execute(&registry, request).await)
            }
        };
        protocol::send(&mut writer, &response).await?;
    }

    tracing::debug!("engine closed the channel");
    Ok(())
}

/// Serve on the process's stdin/stdout
pub async fn serve_stdio(
    registry: Arc<NodeRegistry>,
    max_frame_bytes: usize,
) -> Result<(), ProtocolError> {
    serve(registry, tokio::io::stdin(), tokio::io::stdout(), max_frame_bytes).await
}

async fn execute(registry: &NodeRegistry, request: ExecuteRequest) -> Result<NodeOutput, NodeError> {
    let node = registry
        .instantiate(&request.node_type, &request.config)
        .map_err(|e| NodeError::Configuration(e.to_string()))?;

    let mut ctx = NodeContext::new(
        request.run_id,
        request.node_id.clone(),
        EventEmitter::detached(request.run_id, request.node_id),
    );
    ctx.attempt = request.attempt;
    ctx.inputs = request.inputs;
    ctx.config = request.config;
    ctx.variables = request.variables;

    run_in_process(node, ctx, Duration::from_millis(request.deadline_ms)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ConfigSchema;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use tokio::io::duplex;
    use uuid::Uuid;
    use weftcore::{Node, Value};

    struct Upper;

    #[async_trait]
    impl Node for Upper {
        fn node_type(&self) -> &str {
            "test.upper"
        }

        async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
            let text = ctx
                .require_input("text")?
                .as_str()
                .ok_or_else(|| NodeError::InvalidInputType {
                    field: "text".into(),
                    expected: "string".into(),
                    actual: "other".into(),
                })?
                .to_uppercase();
            Ok(NodeOutput::new().with_output("text", text))
        }
    }

    fn registry() -> Arc<NodeRegistry> {
        let mut registry = NodeRegistry::new();
        registry
            .register_fn("test.upper", ConfigSchema::new(), |_| Ok(Arc::new(Upper) as Arc<dyn Node>))
            .unwrap();
        Arc::new(registry)
    }

    fn request(inputs: HashMap<String, Value>) -> ExecuteRequest {
        ExecuteRequest {
            run_id: Uuid::new_v4(),
            node_id: "u".into(),
            node_type: "test.upper".into(),
            attempt: 1,
            config: HashMap::new(),
            inputs,
            variables: HashMap::new(),
            deadline_ms: 1000,
        }
    }

    #[tokio::test]
    async fn handshake_then_execute() {
        let (engine_side, worker_side) = duplex(64 * 1024);
        let (worker_read, worker_write) = tokio::io::split(worker_side);
        let server = tokio::spawn(serve(registry(), worker_read, worker_write, 1 << 20));

        let (engine_read, engine_write) = tokio::io::split(engine_side);
        let mut reader = protocol::frame_reader(engine_read, 1 << 20);
        let mut writer = protocol::frame_writer(engine_write, 1 << 20);

        protocol::send(&mut writer, &WorkerRequest::Handshake { protocol_version: PROTOCOL_VERSION })
            .await
            .unwrap();
        match protocol::recv(&mut reader).await.unwrap() {
            Some(WorkerResponse::HandshakeAck { node_types, .. }) => {
                assert_eq!(node_types, vec!["test.upper".to_string()])
            }
            other => panic!("unexpected {:?}", other),
        }

        let inputs = HashMap::from([("text".to_string(), Value::from("hi"))]);
        protocol::send(&mut writer, &WorkerRequest::Execute(request(inputs))).await.unwrap();
        match protocol::recv(&mut reader).await.unwrap() {
            Some(WorkerResponse::Result(Ok(output))) => {
                assert_eq!(output.outputs.get("text"), Some(&Value::from("HI")))
            }
            other => panic!("unexpected {:?}", other),
        }

        // Node errors travel back as values
        protocol::send(&mut writer, &WorkerRequest::Execute(request(HashMap::new()))).await.unwrap();
        match protocol::recv(&mut reader).await.unwrap() {
            Some(WorkerResponse::Result(Err(NodeError::MissingInput(name)))) => assert_eq!(name, "text"),
            other => panic!("unexpected {:?}", other),
        }

        drop(writer);
        drop(reader);
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unknown_type_is_a_configuration_error() {
        let mut req = request(HashMap::new());
        req.node_type = "missing".into();
        let err = execute(&registry(), req).await.unwrap_err();
        assert!(matches!(err, NodeError::Configuration(_)));
    }
}
