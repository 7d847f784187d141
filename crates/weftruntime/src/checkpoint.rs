//! Append-only checkpoint stores used to resume interrupted runs.
//!
//! A checkpoint is written for every node execution outcome and for every
//! dependency skip, before the result becomes visible in the execution
//! context. Halt and cancel skips are not recorded; resume re-derives them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, RwLock};
use weftcore::{CheckpointError, NodeId, NodeResult, RunId, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: RunId,
    pub node_id: NodeId,
    pub result: NodeResult,
    /// Variables the node published alongside its result
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    pub recorded_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(
        run_id: RunId,
        node_id: impl Into<NodeId>,
        result: NodeResult,
        variables: HashMap<String, Value>,
    ) -> Self {
        Self {
            run_id,
            node_id: node_id.into(),
            result,
            variables,
            recorded_at: Utc::now(),
        }
    }
}

/// Storage for run checkpoints, keyed by run id.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Durably append one checkpoint. Returns only once the record is stored.
    async fn append(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

    /// All checkpoints of a run in append order; empty for an unknown run.
    async fn load(&self, run_id: RunId) -> Result<Vec<Checkpoint>, CheckpointError>;
}

/// Process-local store; contents are lost on exit.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    runs: RwLock<HashMap<RunId, Vec<Checkpoint>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn append(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        self.runs
            .write()
            .await
            .entry(checkpoint.run_id)
            .or_default()
            .push(checkpoint.clone());
        Ok(())
    }

    async fn load(&self, run_id: RunId) -> Result<Vec<Checkpoint>, CheckpointError> {
        Ok(self.runs.read().await.get(&run_id).cloned().unwrap_or_default())
    }
}

/// JSON-lines store with one `<run_id>.jsonl` file per run under `dir`.
pub struct FileCheckpointStore {
    dir: PathBuf,
    // Serializes appends so lines from concurrent nodes never interleave
    write_lock: Mutex<()>,
}

impl FileCheckpointStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path_for(&self, run_id: RunId) -> PathBuf {
        self.dir.join(format!("{}.jsonl", run_id))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn append(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let mut line = serde_json::to_vec(checkpoint)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(self.path_for(checkpoint.run_id))
            .await?;
        trim_torn_tail(&mut file, checkpoint.run_id).await?;
        file.seek(SeekFrom::End(0)).await?;
        file.write_all(&line).await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn load(&self, run_id: RunId) -> Result<Vec<Checkpoint>, CheckpointError> {
        let text = match tokio::fs::read_to_string(self.path_for(run_id)).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
        let mut checkpoints = Vec::with_capacity(lines.len());
        for (i, line) in lines.iter().enumerate() {
            match serde_json::from_str::<Checkpoint>(line) {
                Ok(checkpoint) => checkpoints.push(checkpoint),
                // A crash mid-append can leave a partial last line
                Err(e) if i + 1 == lines.len() && !text.ends_with('\n') => {
                    tracing::warn!(run_id = %run_id, error = %e, "ignoring torn checkpoint line");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(checkpoints)
    }
}

/// Cut a partial last line left by a crash mid-append, so the next record
/// starts on a line of its own
async fn trim_torn_tail(file: &mut tokio::fs::File, run_id: RunId) -> std::io::Result<()> {
    let len = file.metadata().await?.len();
    if len == 0 {
        return Ok(());
    }
    file.seek(SeekFrom::End(-1)).await?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last).await?;
    if last[0] == b'\n' {
        return Ok(());
    }

    file.seek(SeekFrom::Start(0)).await?;
    let mut contents = Vec::with_capacity(len as usize);
    file.read_to_end(&mut contents).await?;
    let keep = contents
        .iter()
        .rposition(|b| *b == b'\n')
        .map(|i| i + 1)
        .unwrap_or(0) as u64;
    tracing::warn!(run_id = %run_id, dropped_bytes = len - keep, "truncating torn checkpoint line");
    file.set_len(keep).await
}
