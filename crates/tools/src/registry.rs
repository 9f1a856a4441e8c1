use crate::error::RegistryError;
use crate::traits::ToolHandler;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A named tool: metadata plus its handler. Immutable once registered.
#[derive(Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub schema: Option<serde_json::Value>,
    pub handler: Arc<dyn ToolHandler>,
}

impl ToolDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        handler: impl ToolHandler + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schema: None,
            handler: Arc::new(handler),
        }
    }

    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.schema = Some(schema);
        self
    }
}

impl fmt::Debug for ToolDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDefinition")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

/// Name-keyed tool table.
///
/// Populate it during startup, then share it behind an `Arc`; the dispatcher
/// only reads from it.
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<ToolDefinition>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, tool: ToolDefinition) -> Result<&mut Self, RegistryError> {
        if self.tools.contains_key(&tool.name) {
            return Err(RegistryError::DuplicateName(tool.name));
        }
        self.tools.insert(tool.name.clone(), Arc::new(tool));
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<Arc<ToolDefinition>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// All definitions, ordered by name. Call again to restart.
    pub fn list(&self) -> impl Iterator<Item = &ToolDefinition> + '_ {
        self.tools.values().map(|tool| tool.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.tools.len()
    }

    pub fn schemas(&self) -> Vec<serde_json::Value> {
        self.list()
            .map(|tool| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool
                            .schema
                            .clone()
                            .unwrap_or_else(|| serde_json::json!({"type": "object"}))
                    }
                })
            })
            .collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
