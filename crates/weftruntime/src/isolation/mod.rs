//! Out-of-process node execution: the engine-side worker pool, the worker
//! serve loop and the framed protocol between them.

mod channel;
mod monitor;
pub mod protocol;
mod worker;

pub use channel::IsolationChannel;
pub use monitor::{LimitExceeded, ResourceLimits, ResourceMonitor};
pub use protocol::{
    frame_limit_from_env, ExecuteRequest, ProtocolError, WorkerRequest, WorkerResponse, MAX_FRAME_ENV,
    PROTOCOL_VERSION,
};
pub use worker::{serve, serve_stdio};
