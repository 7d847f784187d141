//! Isolation worker: serves node executions over stdin/stdout.
//!
//! Stdout carries protocol frames only, so all logging goes to stderr.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use weftruntime::{isolation, IsolationConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let registry = weftnodes::standard_registry().context("failed to build node registry")?;
    let max_frame_bytes = isolation::frame_limit_from_env()
        .unwrap_or_else(|| IsolationConfig::default().max_frame_bytes);
    tracing::debug!(pid = std::process::id(), max_frame_bytes, "worker started");

    isolation::serve_stdio(Arc::new(registry), max_frame_bytes)
        .await
        .context("worker protocol failure")?;
    Ok(())
}
