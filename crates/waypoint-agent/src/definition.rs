use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tracing::info;

use waypoint_core::error::{Result, WaypointError};
use waypoint_core::types::ToolDefinition;
use waypoint_tools::ToolRegistry;

use crate::control::is_control_tool;
use crate::graph::GraphSpec;

/// A validated graph bound to the tools its nodes use.
///
/// Building a definition is where configuration errors surface: an invalid
/// graph, a node naming a tool the registry does not have, or a registry
/// tool shadowing one of the control tools.
pub struct AgentDefinition {
    pub graph: Arc<GraphSpec>,
    pub tools: Arc<ToolRegistry>,
    node_tools: HashMap<String, Vec<ToolDefinition>>,
}

impl AgentDefinition {
    pub fn new(graph: GraphSpec, tools: ToolRegistry) -> Result<Self> {
        Self::from_shared(Arc::new(graph), Arc::new(tools))
    }

    pub fn from_shared(graph: Arc<GraphSpec>, tools: Arc<ToolRegistry>) -> Result<Self> {
        graph.validate()?;

        if let Some(name) = tools.list().into_iter().find(|n| is_control_tool(n)) {
            return Err(WaypointError::Config(format!(
                "registry tool '{}' collides with a control tool",
                name
            )));
        }

        let mut node_tools = HashMap::new();
        for node in &graph.nodes {
            let defs = tools.definitions_for(&node.tools).map_err(|e| match e {
                WaypointError::ToolNotFound(name) => {
                    WaypointError::ToolNotFound(format!("{} (used by node '{}')", name, node.id))
                }
                other => other,
            })?;
            node_tools.insert(node.id.clone(), defs);
        }

        info!(
            graph_id = %graph.id,
            nodes = graph.nodes.len(),
            tools = tools.list().len(),
            "Agent definition built"
        );
        Ok(Self {
            graph,
            tools,
            node_tools,
        })
    }

    /// Load a graph file and bind it to `tools`.
    pub fn load(path: &Path, tools: ToolRegistry) -> Result<Self> {
        Self::new(GraphSpec::load(path)?, tools)
    }

    /// Registry tool definitions offered while `node_id` is active.
    pub fn tools_for(&self, node_id: &str) -> &[ToolDefinition] {
        self.node_tools
            .get(node_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Whether `tool` may be called from `node_id`.
    pub fn node_allows(&self, node_id: &str, tool: &str) -> bool {
        self.tools_for(node_id).iter().any(|d| d.name == tool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use serde_json::json;
    use waypoint_core::traits::Tool;
    use waypoint_core::types::ToolContext;

    use crate::graph::{EdgeSpec, NodeSpec};

    fn graph(tools: &[&str]) -> GraphSpec {
        GraphSpec {
            id: "g".into(),
            nodes: vec![
                NodeSpec::new("a", "A").with_outputs(&["x"]).with_tools(tools),
                NodeSpec::new("b", "B").with_outputs(&["y"]),
            ],
            edges: vec![EdgeSpec::always("a", "b")],
            entry_points: [("default".to_string(), "a".to_string())].into_iter().collect(),
            ..Default::default()
        }
    }

    struct Shadow;

    impl Tool for Shadow {
        fn name(&self) -> &str {
            "set_output"
        }
        fn description(&self) -> &str {
            "shadows a control tool"
        }
        fn input_schema(&self) -> serde_json::Value {
            json!({"type": "object"})
        }
        fn execute(
            &self,
            _input: serde_json::Value,
            _ctx: ToolContext,
        ) -> BoxFuture<'_, Result<serde_json::Value>> {
            Box::pin(async { Ok(json!({})) })
        }
    }

    #[test]
    fn test_resolves_node_tools() {
        let def = AgentDefinition::new(graph(&["save_data"]), ToolRegistry::with_builtins()).unwrap();
        assert_eq!(def.tools_for("a").len(), 1);
        assert!(def.node_allows("a", "save_data"));
        assert!(!def.node_allows("b", "save_data"));
        assert!(def.tools_for("missing").is_empty());
    }

    #[test]
    fn test_unknown_tool_is_config_error() {
        let err = AgentDefinition::new(graph(&["web_search"]), ToolRegistry::with_builtins())
            .err()
            .unwrap();
        assert!(matches!(err, WaypointError::ToolNotFound(ref m) if m.contains("web_search")));
        assert!(err.is_configuration());
    }

    #[test]
    fn test_control_tool_shadowing_rejected() {
        let mut tools = ToolRegistry::new();
        tools.register(Shadow);
        let err = AgentDefinition::new(graph(&[]), tools).err().unwrap();
        assert!(matches!(err, WaypointError::Config(_)));
    }
}
