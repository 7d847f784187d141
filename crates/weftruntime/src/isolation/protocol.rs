//! Wire protocol between the engine and isolation workers.
//!
//! Every message is one frame: a 4-byte big-endian length followed by a
//! JSON body. A call is a handshake, one execute request and its response;
//! a reused worker repeats the handshake on every call.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use weftcore::{NodeError, NodeId, NodeOutput, RunId, Value};

pub const PROTOCOL_VERSION: u32 = 1;

/// Environment variable carrying the frame size limit to a spawned worker
pub const MAX_FRAME_ENV: &str = "WEFT_MAX_FRAME_BYTES";

/// Frame limit handed down by the engine, if any
pub fn frame_limit_from_env() -> Option<usize> {
    let raw = std::env::var(MAX_FRAME_ENV).ok()?;
    match raw.trim().parse() {
        Ok(limit) => Some(limit),
        Err(_) => {
            tracing::warn!(value = %raw, "ignoring unparsable {}", MAX_FRAME_ENV);
            None
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerRequest {
    Handshake { protocol_version: u32 },
    Execute(ExecuteRequest),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub run_id: RunId,
    pub node_id: NodeId,
    pub node_type: String,
    pub attempt: u32,
    pub config: HashMap<String, Value>,
    pub inputs: HashMap<String, Value>,
    pub variables: HashMap<String, Value>,
    /// Time left for this attempt when the request was sent
    pub deadline_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerResponse {
    HandshakeAck {
        protocol_version: u32,
        node_types: Vec<String>,
    },
    Result(Result<NodeOutput, NodeError>),
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("worker I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("worker closed the channel")]
    Closed,

    #[error("protocol version mismatch: expected {expected}, worker speaks {actual}")]
    Version { expected: u32, actual: u32 },

    #[error("worker does not support node type '{0}'")]
    Unsupported(String),

    #[error("unexpected message: {0}")]
    Unexpected(String),
}

pub type FrameReader<R> = FramedRead<R, LengthDelimitedCodec>;
pub type FrameWriter<W> = FramedWrite<W, LengthDelimitedCodec>;

fn codec_builder(max_frame_bytes: usize) -> tokio_util::codec::length_delimited::Builder {
    let mut builder = LengthDelimitedCodec::builder();
    builder
        .length_field_length(4)
        .big_endian()
        .max_frame_length(max_frame_bytes);
    builder
}

pub fn frame_reader<R: AsyncRead>(reader: R, max_frame_bytes: usize) -> FrameReader<R> {
    codec_builder(max_frame_bytes).new_read(reader)
}

pub fn frame_writer<W: AsyncWrite>(writer: W, max_frame_bytes: usize) -> FrameWriter<W> {
    codec_builder(max_frame_bytes).new_write(writer)
}

pub async fn send<W, M>(writer: &mut FrameWriter<W>, message: &M) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    M: Serialize,
{
    let body = serde_json::to_vec(message)?;
    writer.send(Bytes::from(body)).await?;
    Ok(())
}

/// Read the next message; `None` on a clean end of stream
pub async fn recv<R, M>(reader: &mut FrameReader<R>) -> Result<Option<M>, ProtocolError>
where
    R: AsyncRead + Unpin,
    M: DeserializeOwned,
{
    match reader.next().await {
        None => Ok(None),
        Some(frame) => {
            let frame = frame?;
            Ok(Some(serde_json::from_slice(&frame)?))
        }
    }
}
