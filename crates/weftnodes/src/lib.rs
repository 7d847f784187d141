//! Standard node library
//!
//! Collection of built-in nodes for common operations, plus fault-injection
//! nodes used to exercise retries, error modes and isolation.

mod debug;
mod fault;
mod http;
mod time;
mod transform;

pub use debug::{DebugNode, DebugNodeFactory};
pub use fault::{CrashNode, FailNode, FlakyNode, HogNode};
pub use http::HttpRequestNode;
pub use time::DelayNode;
pub use transform::{JsonParseNode, JsonStringifyNode};

use std::sync::Arc;
use weftcore::ValidationError;
use weftruntime::NodeRegistry;

/// Register all standard nodes with a registry
pub fn register_all(registry: &mut NodeRegistry) -> Result<(), ValidationError> {
    registry.register(Arc::new(debug::DebugNodeFactory))?;
    registry.register(Arc::new(http::HttpRequestNodeFactory))?;
    registry.register(Arc::new(transform::JsonParseNodeFactory))?;
    registry.register(Arc::new(transform::JsonStringifyNodeFactory))?;
    registry.register(Arc::new(time::DelayNodeFactory))?;
    registry.register(Arc::new(fault::FailNodeFactory))?;
    registry.register(Arc::new(fault::FlakyNodeFactory))?;
    registry.register(Arc::new(fault::CrashNodeFactory))?;
    registry.register(Arc::new(fault::HogNodeFactory))?;
    Ok(())
}

/// A registry holding every standard node
pub fn standard_registry() -> Result<NodeRegistry, ValidationError> {
    let mut registry = NodeRegistry::new();
    register_all(&mut registry)?;
    Ok(registry)
}
