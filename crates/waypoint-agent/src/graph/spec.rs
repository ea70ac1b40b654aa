use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use waypoint_core::error::{Result, WaypointError};

use super::edge::EdgeSpec;
use super::node::NodeSpec;
use crate::memory::SharedMemory;

/// Name of the entry point used when a caller does not pick one.
pub const DEFAULT_ENTRY_POINT: &str = "default";

/// Descriptive metadata for an agent definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: String,
}

/// Immutable description of an agent: its phases and the transitions
/// between them.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GraphSpec {
    pub id: String,
    #[serde(default)]
    pub metadata: AgentMetadata,
    /// Layer-1 prompt shared by every phase.
    #[serde(default)]
    pub identity_prompt: String,
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
    /// Edges in evaluation order.
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
    /// Entry point name -> node id.
    #[serde(default)]
    pub entry_points: BTreeMap<String, String>,
    /// Optional explicit list of nodes where the session ends.
    #[serde(default)]
    pub terminal_nodes: Vec<String>,
}

/// Signal raised by a control tool during a turn.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolSignal {
    /// `transition_to` asked for a specific next node.
    Goto { target: String, reason: String },
    /// `complete_session` ended the session.
    Complete { summary: String },
}

/// Outcome of edge evaluation after a finished turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextStep {
    /// Move to this node.
    Node(String),
    /// The session is complete.
    Terminal,
    /// The exit condition is unmet and the node has no visits left.
    Stalled,
    /// The exit condition is unmet; the node may keep working.
    Continue,
}

impl GraphSpec {
    /// Parse and validate a graph from TOML.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let spec: Self =
            toml::from_str(content).map_err(|e| WaypointError::InvalidGraph(e.to_string()))?;
        spec.validate()?;
        Ok(spec)
    }

    /// Parse and validate a graph from JSON.
    pub fn from_json_str(content: &str) -> Result<Self> {
        let spec: Self = serde_json::from_str(content)
            .map_err(|e| WaypointError::InvalidGraph(e.to_string()))?;
        spec.validate()?;
        Ok(spec)
    }

    /// Load a graph file. `.json` files are parsed as JSON, anything else
    /// as TOML.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| WaypointError::ConfigNotFound(path.display().to_string()))?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        debug!(path = %path.display(), json = is_json, "Loading graph");
        if is_json {
            Self::from_json_str(&content)
        } else {
            Self::from_toml_str(&content)
        }
    }

    pub fn get_node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Like [`get_node`](Self::get_node), but a missing node is an error.
    pub fn node(&self, id: &str) -> Result<&NodeSpec> {
        self.get_node(id)
            .ok_or_else(|| WaypointError::NodeNotFound(id.to_string()))
    }

    /// Outgoing edges of `id`, in evaluation order.
    pub fn outgoing<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a EdgeSpec> + 'a {
        self.edges.iter().filter(move |e| e.from == id)
    }

    pub fn has_outgoing(&self, id: &str) -> bool {
        self.outgoing(id).next().is_some()
    }

    /// Whether a session ends when `id` is satisfied.
    pub fn is_terminal(&self, id: &str) -> bool {
        !self.has_outgoing(id)
    }

    /// Resolve an entry point name to its node id. With a single entry
    /// point, `"default"` resolves to it whatever its name.
    pub fn entry_node(&self, entry_point: &str) -> Result<&str> {
        if let Some(node) = self.entry_points.get(entry_point) {
            return Ok(node.as_str());
        }
        if entry_point == DEFAULT_ENTRY_POINT && self.entry_points.len() == 1 {
            if let Some(node) = self.entry_points.values().next() {
                return Ok(node.as_str());
            }
        }
        Err(WaypointError::Config(format!(
            "unknown entry point '{}' in graph '{}'",
            entry_point, self.id
        )))
    }

    /// Required outputs of `node` that are not yet set in `memory`.
    pub fn missing_outputs(node: &NodeSpec, memory: &SharedMemory) -> Vec<String> {
        node.required_outputs()
            .filter(|k| !memory.is_present(k))
            .map(str::to_string)
            .collect()
    }

    /// Decide what follows a finished turn in `current_id`.
    ///
    /// An explicit tool signal always wins. Otherwise, once every required
    /// output is present, a node without outgoing edges ends the session and
    /// any other node follows its first matching edge. A node whose exit
    /// condition is unmet is `Stalled` when `visits` has reached its ceiling
    /// and `Continue` otherwise.
    pub fn next_node(
        &self,
        current_id: &str,
        memory: &SharedMemory,
        visits: u32,
        signal: Option<&ToolSignal>,
    ) -> Result<NextStep> {
        let node = self.node(current_id)?;

        match signal {
            Some(ToolSignal::Goto { target, .. }) => return Ok(NextStep::Node(target.clone())),
            Some(ToolSignal::Complete { .. }) => return Ok(NextStep::Terminal),
            None => {}
        }

        if Self::missing_outputs(node, memory).is_empty() {
            if !self.has_outgoing(current_id) {
                return Ok(NextStep::Terminal);
            }
            if let Some(edge) = self.outgoing(current_id).find(|e| e.matches(memory)) {
                return Ok(NextStep::Node(edge.to.clone()));
            }
            debug!(node_id = %current_id, "Outputs satisfied but no edge condition holds");
        }

        if node.visits_exhausted(visits) {
            Ok(NextStep::Stalled)
        } else {
            Ok(NextStep::Continue)
        }
    }

    /// Check the structural invariants of the graph. All problems are
    /// reported together.
    pub fn validate(&self) -> Result<()> {
        let mut problems: Vec<String> = Vec::new();

        if self.id.trim().is_empty() {
            problems.push("graph id must not be empty".into());
        }
        if self.nodes.is_empty() {
            problems.push("graph has no nodes".into());
        }

        let mut ids = HashSet::new();
        for node in &self.nodes {
            if node.id.trim().is_empty() {
                problems.push("node with empty id".into());
            } else if !ids.insert(node.id.as_str()) {
                problems.push(format!("duplicate node id '{}'", node.id));
            }
            if node.max_iterations == 0 {
                problems.push(format!("node '{}' has max_iterations = 0", node.id));
            }
            for key in &node.nullable_output_keys {
                if !node.output_keys.contains(key) {
                    problems.push(format!(
                        "node '{}' lists nullable output '{}' that is not an output key",
                        node.id, key
                    ));
                }
            }
        }

        for edge in &self.edges {
            for endpoint in [&edge.from, &edge.to] {
                if !ids.contains(endpoint.as_str()) {
                    problems.push(format!(
                        "edge {} -> {} references unknown node '{}'",
                        edge.from, edge.to, endpoint
                    ));
                }
            }
        }

        if self.entry_points.is_empty() {
            problems.push("graph declares no entry points".into());
        } else if self.entry_points.len() > 1
            && !self.entry_points.contains_key(DEFAULT_ENTRY_POINT)
        {
            problems.push(format!(
                "graph with several entry points must declare '{}'",
                DEFAULT_ENTRY_POINT
            ));
        }
        for (name, node) in &self.entry_points {
            if !ids.contains(node.as_str()) {
                problems.push(format!("entry point '{}' references unknown node '{}'", name, node));
            }
        }

        for id in &self.terminal_nodes {
            if !ids.contains(id.as_str()) {
                problems.push(format!("terminal node '{}' does not exist", id));
            } else if self.has_outgoing(id) {
                problems.push(format!("terminal node '{}' has outgoing edges", id));
            }
        }
        if !self.terminal_nodes.is_empty() {
            for node in &self.nodes {
                if !self.terminal_nodes.contains(&node.id) && !self.has_outgoing(&node.id) {
                    problems.push(format!(
                        "node '{}' has no outgoing edges and is not a terminal node",
                        node.id
                    ));
                }
            }
        }
        if !self.nodes.is_empty() && self.nodes.iter().all(|n| self.has_outgoing(&n.id)) {
            problems.push("graph has no terminal node".into());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(WaypointError::InvalidGraph(problems.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn two_node_graph() -> GraphSpec {
        GraphSpec {
            id: "pipeline".into(),
            metadata: AgentMetadata::default(),
            identity_prompt: "You are a careful analyst.".into(),
            nodes: vec![
                NodeSpec::new("a", "Gather").with_outputs(&["x"]),
                NodeSpec::new("b", "Report").with_outputs(&["report"]),
            ],
            edges: vec![EdgeSpec::always("a", "b")],
            entry_points: BTreeMap::from([("default".to_string(), "a".to_string())]),
            terminal_nodes: vec![],
        }
    }

    #[test]
    fn test_valid_graph() {
        let graph = two_node_graph();
        graph.validate().unwrap();
        assert_eq!(graph.entry_node("default").unwrap(), "a");
        assert!(graph.is_terminal("b"));
        assert!(!graph.is_terminal("a"));
        assert!(graph.get_node("zzz").is_none());
    }

    #[test]
    fn test_next_node_requires_outputs() {
        let graph = two_node_graph();
        let mut memory = SharedMemory::new();

        assert_eq!(graph.next_node("a", &memory, 0, None).unwrap(), NextStep::Continue);
        assert_eq!(graph.next_node("a", &memory, 1, None).unwrap(), NextStep::Stalled);

        memory.write("x", json!("value"), Some("a"));
        assert_eq!(
            graph.next_node("a", &memory, 1, None).unwrap(),
            NextStep::Node("b".into())
        );

        memory.write("report", json!("done"), Some("b"));
        assert_eq!(graph.next_node("b", &memory, 1, None).unwrap(), NextStep::Terminal);
    }

    #[test]
    fn test_signal_wins() {
        let graph = two_node_graph();
        let memory = SharedMemory::new();
        let goto = ToolSignal::Goto {
            target: "b".into(),
            reason: "skip".into(),
        };
        assert_eq!(
            graph.next_node("a", &memory, 1, Some(&goto)).unwrap(),
            NextStep::Node("b".into())
        );
        let complete = ToolSignal::Complete {
            summary: "done".into(),
        };
        assert_eq!(
            graph.next_node("b", &memory, 1, Some(&complete)).unwrap(),
            NextStep::Terminal
        );
    }

    #[test]
    fn test_nullable_outputs_not_required() {
        let mut graph = two_node_graph();
        graph.nodes[0] = NodeSpec::new("a", "Gather")
            .with_outputs(&["x", "extra"])
            .with_nullable_outputs(&["extra"]);
        let mut memory = SharedMemory::new();
        memory.write("x", json!(1), Some("a"));
        assert_eq!(
            graph.next_node("a", &memory, 1, None).unwrap(),
            NextStep::Node("b".into())
        );
    }

    #[test]
    fn test_first_matching_edge_in_order() {
        let mut graph = two_node_graph();
        graph.nodes.push(NodeSpec::new("c", "Escalate"));
        graph.edges = vec![
            EdgeSpec::conditional("a", "c", r#"x == "bad""#),
            EdgeSpec::always("a", "b"),
        ];
        let mut memory = SharedMemory::new();
        memory.write("x", json!("bad"), Some("a"));
        assert_eq!(
            graph.next_node("a", &memory, 1, None).unwrap(),
            NextStep::Node("c".into())
        );
        memory.write("x", json!("good"), Some("a"));
        assert_eq!(
            graph.next_node("a", &memory, 1, None).unwrap(),
            NextStep::Node("b".into())
        );
    }

    #[test]
    fn test_validation_errors_reported_together() {
        let mut graph = two_node_graph();
        graph.nodes.push(NodeSpec::new("a", "Dup"));
        graph.edges.push(EdgeSpec::always("b", "ghost"));
        graph
            .entry_points
            .insert("webhook".into(), "missing".into());

        let err = graph.validate().unwrap_err().to_string();
        assert!(err.contains("duplicate node id 'a'"), "{}", err);
        assert!(err.contains("unknown node 'ghost'"), "{}", err);
        assert!(err.contains("entry point 'webhook'"), "{}", err);
    }

    #[test]
    fn test_several_entry_points_need_default() {
        let mut graph = two_node_graph();
        graph.entry_points = BTreeMap::from([
            ("chat".to_string(), "a".to_string()),
            ("webhook".to_string(), "b".to_string()),
        ]);
        assert!(graph.validate().is_err());
        assert!(graph.entry_node("default").is_err());
        assert_eq!(graph.entry_node("webhook").unwrap(), "b");
    }

    #[test]
    fn test_single_entry_point_answers_to_default() {
        let mut graph = two_node_graph();
        graph.entry_points = BTreeMap::from([("chat".to_string(), "a".to_string())]);
        graph.validate().unwrap();
        assert_eq!(graph.entry_node("default").unwrap(), "a");
    }

    #[test]
    fn test_terminal_nodes_checked() {
        let mut graph = two_node_graph();
        graph.terminal_nodes = vec!["a".into()];
        let err = graph.validate().unwrap_err().to_string();
        assert!(err.contains("terminal node 'a' has outgoing edges"), "{}", err);
        assert!(err.contains("node 'b' has no outgoing edges"), "{}", err);

        graph.terminal_nodes = vec!["b".into()];
        graph.validate().unwrap();
    }

    #[test]
    fn test_cycle_without_exit_rejected() {
        let mut graph = two_node_graph();
        graph.edges.push(EdgeSpec::always("b", "a"));
        let err = graph.validate().unwrap_err().to_string();
        assert!(err.contains("no terminal node"), "{}", err);
    }

    #[test]
    fn test_from_toml() {
        let graph = GraphSpec::from_toml_str(
            r#"
id = "research"
identity_prompt = "You are a research assistant."

[metadata]
name = "Research Agent"

[entry_points]
default = "intake"

[[nodes]]
id = "intake"
name = "Intake"
client_facing = true
output_keys = ["topic"]

[[nodes]]
id = "report"
name = "Report"
output_keys = ["report"]
max_node_visits = 2

[[edges]]
from = "intake"
to = "report"
condition = { type = "key_present", key = "topic" }
"#,
        )
        .unwrap();
        assert_eq!(graph.metadata.name, "Research Agent");
        assert_eq!(graph.nodes.len(), 2);
        assert!(graph.nodes[0].client_facing);
        assert_eq!(graph.node("report").unwrap().max_node_visits, 2);
        assert_eq!(graph.edges[0], EdgeSpec::key_present("intake", "report", "topic"));
    }

    #[test]
    fn test_from_json_invalid() {
        let err = GraphSpec::from_json_str(r#"{"id": "x", "nodes": []}"#).unwrap_err();
        assert!(matches!(err, WaypointError::InvalidGraph(_)));
    }
}
