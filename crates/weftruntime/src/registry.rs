use crate::schema::ConfigSchema;
use std::collections::HashMap;
use std::sync::Arc;
use weftcore::{Node, NodeError, ValidationError, Value};

/// Factory trait for creating node instances
pub trait NodeFactory: Send + Sync {
    /// Create a new instance of the node with given configuration
    fn create(&self, config: &HashMap<String, Value>) -> Result<Arc<dyn Node>, NodeError>;

    /// Get node type identifier
    fn node_type(&self) -> &str;

    /// Configuration schema checked before `create` is called
    fn schema(&self) -> ConfigSchema {
        ConfigSchema::default()
    }

    /// Whether every instance of this type must run in an isolated worker
    fn requires_isolation(&self) -> bool {
        false
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::default()
    }
}

/// Metadata about a node type
#[derive(Debug, Clone)]
pub struct NodeMetadata {
    pub description: String,
    pub category: String,
    pub inputs: Vec<PortDefinition>,
    pub outputs: Vec<PortDefinition>,
}

impl Default for NodeMetadata {
    fn default() -> Self {
        Self {
            description: String::new(),
            category: "general".to_string(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PortDefinition {
    pub name: String,
    pub description: String,
    pub required: bool,
}

impl PortDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>, required: bool) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            required,
        }
    }
}

type Constructor =
    dyn Fn(&HashMap<String, Value>) -> Result<Arc<dyn Node>, NodeError> + Send + Sync;

/// Closure-backed factory for ad-hoc registrations
struct FnFactory {
    node_type: String,
    schema: ConfigSchema,
    constructor: Box<Constructor>,
}

impl NodeFactory for FnFactory {
    fn create(&self, config: &HashMap<String, Value>) -> Result<Arc<dyn Node>, NodeError> {
        (self.constructor)(config)
    }

    fn node_type(&self) -> &str {
        &self.node_type
    }

    fn schema(&self) -> ConfigSchema {
        self.schema.clone()
    }
}

/// Registry of available node types.
///
/// Populated at startup and then shared behind an `Arc`; there is no way
/// to remove or replace a registration.
pub struct NodeRegistry {
    factories: HashMap<String, Arc<dyn NodeFactory>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a node factory. Registering the same type twice is an error.
    pub fn register(&mut self, factory: Arc<dyn NodeFactory>) -> Result<(), ValidationError> {
        let node_type = factory.node_type().to_string();
        if self.factories.contains_key(&node_type) {
            tracing::error!(node_type = %node_type, "duplicate node type registration");
            return Err(ValidationError::DuplicateType(node_type));
        }
        tracing::debug!(node_type = %node_type, "registered node type");
        self.factories.insert(node_type, factory);
        Ok(())
    }

    /// Register a constructor closure with its schema
    pub fn register_fn<F>(
        &mut self,
        node_type: impl Into<String>,
        schema: ConfigSchema,
        constructor: F,
    ) -> Result<(), ValidationError>
    where
        F: Fn(&HashMap<String, Value>) -> Result<Arc<dyn Node>, NodeError> + Send + Sync + 'static,
    {
        self.register(Arc::new(FnFactory {
            node_type: node_type.into(),
            schema,
            constructor: Box::new(constructor),
        }))
    }

    /// Check a configuration against the type's schema without building a node
    pub fn validate(
        &self,
        node_type: &str,
        config: &HashMap<String, Value>,
    ) -> Result<(), ValidationError> {
        let factory = self.factory(node_type)?;
        factory.schema().validate(node_type, config)
    }

    /// Validate the configuration and construct a node instance
    pub fn instantiate(
        &self,
        node_type: &str,
        config: &HashMap<String, Value>,
    ) -> Result<Arc<dyn Node>, ValidationError> {
        let factory = self.factory(node_type)?;
        factory.schema().validate(node_type, config)?;
        factory.create(config).map_err(|e| ValidationError::Rejected {
            node_type: node_type.to_string(),
            message: e.to_string(),
        })
    }

    pub fn requires_isolation(&self, node_type: &str) -> bool {
        self.factories
            .get(node_type)
            .map(|f| f.requires_isolation())
            .unwrap_or(false)
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.factories.contains_key(node_type)
    }

    /// Get all registered node types, sorted
    pub fn list_node_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn get_metadata(&self, node_type: &str) -> Option<NodeMetadata> {
        self.factories.get(node_type).map(|f| f.metadata())
    }

    pub fn get_schema(&self, node_type: &str) -> Option<ConfigSchema> {
        self.factories.get(node_type).map(|f| f.schema())
    }

    fn factory(&self, node_type: &str) -> Result<&Arc<dyn NodeFactory>, ValidationError> {
        self.factories
            .get(node_type)
            .ok_or_else(|| ValidationError::UnknownType(node_type.to_string()))
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
