use super::monitor::{ResourceLimits, ResourceMonitor};
use super::protocol::{
    self, ExecuteRequest, FrameReader, FrameWriter, ProtocolError, WorkerRequest, WorkerResponse,
    MAX_FRAME_ENV, PROTOCOL_VERSION,
};
use crate::config::IsolationConfig;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use weftcore::{FlowError, NodeError, NodeOutput};

/// A spawned worker process and its framed stdio
struct Worker {
    child: Child,
    pid: u32,
    reader: FrameReader<ChildStdout>,
    writer: FrameWriter<ChildStdin>,
    _permit: OwnedSemaphorePermit,
}

impl Worker {
    /// Handshake, then one execute request. The outer result is the
    /// channel's health; the inner one is the node's own outcome.
    async fn call(
        &mut self,
        request: &ExecuteRequest,
    ) -> Result<Result<NodeOutput, NodeError>, ProtocolError> {
        protocol::send(
            &mut self.writer,
            &WorkerRequest::Handshake {
                protocol_version: PROTOCOL_VERSION,
            },
        )
        .await?;

        match protocol::recv(&mut self.reader).await? {
            Some(WorkerResponse::HandshakeAck {
                protocol_version,
                node_types,
            }) => {
                if protocol_version != PROTOCOL_VERSION {
                    return Err(ProtocolError::Version {
                        expected: PROTOCOL_VERSION,
                        actual: protocol_version,
                    });
                }
                if !node_types.iter().any(|t| t == &request.node_type) {
                    return Err(ProtocolError::Unsupported(request.node_type.clone()));
                }
            }
            Some(other) => return Err(ProtocolError::Unexpected(format!("{:?}", other))),
            None => return Err(ProtocolError::Closed),
        }

        protocol::send(&mut self.writer, &WorkerRequest::Execute(request.clone())).await?;

        match protocol::recv(&mut self.reader).await? {
            Some(WorkerResponse::Result(result)) => Ok(result),
            Some(other) => Err(ProtocolError::Unexpected(format!("{:?}", other))),
            None => Err(ProtocolError::Closed),
        }
    }

    /// Kill the process and reap it
    async fn terminate(mut self) -> Option<ExitStatus> {
        if let Ok(Some(status)) = self.child.try_wait() {
            return Some(status);
        }
        let _ = self.child.start_kill();
        tokio::time::timeout(Duration::from_secs(1), self.child.wait())
            .await
            .ok()
            .and_then(Result::ok)
    }
}

/// Runs nodes in separate worker processes.
///
/// Workers are spawned on demand, bounded by a global semaphore, and
/// returned to a per-node-type idle pool after a clean call. Any fault
/// (crash, malformed frame, limit breach, timeout, cancellation) kills the
/// worker instead of returning it.
pub struct IsolationChannel {
    program: PathBuf,
    config: IsolationConfig,
    permits: Arc<Semaphore>,
    idle: Mutex<HashMap<String, Vec<Worker>>>,
}

impl IsolationChannel {
    pub fn new(config: IsolationConfig) -> Result<Self, FlowError> {
        let program = config.worker_program.clone().ok_or_else(|| {
            FlowError::Execution("isolation requires a worker program".to_string())
        })?;
        Ok(Self {
            program,
            permits: Arc::new(Semaphore::new(config.max_workers.max(1))),
            idle: Mutex::new(HashMap::new()),
            config,
        })
    }

    /// Worker processes currently parked in the idle pool
    pub fn idle_workers(&self) -> usize {
        self.idle
            .lock()
            .map(|idle| idle.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    pub async fn execute(
        &self,
        request: ExecuteRequest,
        timeout: Duration,
        cancellation: &CancellationToken,
    ) -> Result<NodeOutput, NodeError> {
        let mut worker = tokio::select! {
            _ = cancellation.cancelled() => return Err(NodeError::Cancelled),
            worker = self.checkout(&request.node_type) => worker?,
        };

        let monitor = ResourceMonitor::new(
            worker.pid,
            ResourceLimits {
                max_memory_bytes: self.config.max_memory_bytes,
                max_cpu_ms: self.config.max_cpu_ms,
                interval: Duration::from_millis(self.config.monitor_interval_ms.max(1)),
            },
        );

        let outcome = tokio::select! {
            _ = cancellation.cancelled() => Err(NodeError::Cancelled),
            _ = tokio::time::sleep(timeout) => Err(NodeError::Timeout {
                millis: timeout.as_millis() as u64,
            }),
            exceeded = monitor.exceeded() => Err(NodeError::IsolationFault(exceeded.to_string())),
            result = worker.call(&request) => result.map_err(|e| NodeError::IsolationFault(e.to_string())),
        };

        match outcome {
            Ok(result) => {
                self.checkin(&request.node_type, worker);
                result
            }
            Err(error) => {
                let pid = worker.pid;
                let status = worker.terminate().await;
                tracing::warn!(
                    run_id = %request.run_id,
                    node_id = %request.node_id,
                    pid,
                    exit_status = ?status,
                    error = %error,
                    "isolation worker terminated"
                );
                Err(match (error, status) {
                    (NodeError::IsolationFault(message), Some(status)) if !status.success() => {
                        NodeError::IsolationFault(format!("{} ({})", message, status))
                    }
                    (error, _) => error,
                })
            }
        }
    }

    async fn checkout(&self, node_type: &str) -> Result<Worker, NodeError> {
        if let Some(worker) = self.take_idle(node_type) {
            tracing::debug!(node_type, pid = worker.pid, "reusing idle worker");
            return Ok(worker);
        }

        let permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                // Idle workers of other types hold slots; free one before waiting
                if let Some(evicted) = self.evict_any() {
                    evicted.terminate().await;
                }
                self.permits
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|e| NodeError::IsolationFault(e.to_string()))?
            }
        };

        // Another call may have parked a worker while we waited
        if let Some(worker) = self.take_idle(node_type) {
            return Ok(worker);
        }
        self.spawn(permit)
    }

    fn spawn(&self, permit: OwnedSemaphorePermit) -> Result<Worker, NodeError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.config.worker_args)
            .env(MAX_FRAME_ENV, self.config.max_frame_bytes.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            NodeError::IsolationFault(format!(
                "failed to spawn worker {}: {}",
                self.program.display(),
                e
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| NodeError::IsolationFault("worker stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| NodeError::IsolationFault("worker stdout unavailable".into()))?;
        let pid = child.id().unwrap_or_default();

        tracing::debug!(pid, program = %self.program.display(), "spawned isolation worker");
        Ok(Worker {
            child,
            pid,
            reader: protocol::frame_reader(stdout, self.config.max_frame_bytes),
            writer: protocol::frame_writer(stdin, self.config.max_frame_bytes),
            _permit: permit,
        })
    }

    fn take_idle(&self, node_type: &str) -> Option<Worker> {
        self.idle.lock().ok()?.get_mut(node_type)?.pop()
    }

    fn evict_any(&self) -> Option<Worker> {
        let mut idle = self.idle.lock().ok()?;
        idle.values_mut().find_map(Vec::pop)
    }

    fn checkin(&self, node_type: &str, worker: Worker) {
        let Ok(mut idle) = self.idle.lock() else {
            return;
        };
        let pool = idle.entry(node_type.to_string()).or_default();
        if pool.len() < self.config.max_idle_per_type {
            pool.push(worker);
        }
        // Dropping a surplus worker kills it and releases its slot
    }
}
