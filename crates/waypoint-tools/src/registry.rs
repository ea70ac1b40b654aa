use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use waypoint_core::error::{Result, WaypointError};
use waypoint_core::traits::Tool;
use waypoint_core::types::{ToolContext, ToolDefinition, ToolResult};

/// Registry of available tools.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool.
    pub fn register(&mut self, tool: impl Tool) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            warn!(tool = %name, "Replacing previously registered tool");
        }
    }

    /// Unregister a tool by name.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// List all registered tool names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Tool definitions for sending to the LLM, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self.tools.values().map(|t| definition(t.as_ref())).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Definitions for exactly `names`, in the given order.
    /// Unknown names are an error.
    pub fn definitions_for(&self, names: &[String]) -> Result<Vec<ToolDefinition>> {
        names
            .iter()
            .map(|name| {
                self.tools
                    .get(name)
                    .map(|t| definition(t.as_ref()))
                    .ok_or_else(|| WaypointError::ToolNotFound(name.clone()))
            })
            .collect()
    }

    /// Execute a tool by name and return its raw JSON value.
    ///
    /// The tool runs on its own task under its timeout, so a tool that
    /// blocks or panics never takes the caller down with it.
    pub async fn invoke(
        &self,
        name: &str,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> Result<serde_json::Value> {
        let tool = self
            .get(name)
            .ok_or_else(|| WaypointError::ToolNotFound(name.to_string()))?;

        let timeout_secs = tool.timeout_secs();
        let timeout = std::time::Duration::from_secs(timeout_secs);
        let handle = tokio::spawn(async move { tool.execute(input, ctx).await });
        let abort = handle.abort_handle();

        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(WaypointError::ToolExecution {
                tool: name.to_string(),
                message: format!("tool task failed: {}", join_err),
            }),
            Err(_) => {
                abort.abort();
                Err(WaypointError::ToolTimeout {
                    tool: name.to_string(),
                    timeout_secs,
                })
            }
        }
    }

    /// Execute a tool by name. Failures of any kind come back as an error
    /// result for the model instead of an `Err`.
    pub async fn execute(
        &self,
        name: &str,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> ToolResult {
        match self.invoke(name, input, ctx).await {
            Ok(value) => {
                let result = ToolResult::from_value(value);
                debug!(tool = %name, is_error = result.is_error, "Tool finished");
                result
            }
            Err(e) => {
                warn!(tool = %name, error = %e, "Tool failed");
                ToolResult::error(e.to_string())
            }
        }
    }

    /// Create a registry with the built-in data tools registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();

        registry.register(crate::builtin::data::SaveDataTool);
        registry.register(crate::builtin::data::AppendDataTool);
        registry.register(crate::builtin::data::LoadDataTool);
        registry.register(crate::builtin::data::ListDataFilesTool);

        registry
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn definition(tool: &dyn Tool) -> ToolDefinition {
    ToolDefinition {
        name: tool.name().to_string(),
        description: tool.description().to_string(),
        input_schema: tool.input_schema(),
    }
}
