use serde::{Deserialize, Serialize};

use waypoint_core::session::NodeSnapshot;

/// A phase of the agent: its own focus prompt, tools, and output contract.
///
/// A node is done once every required output (declared in `output_keys` and
/// not listed in `nullable_output_keys`) holds a non-null value in shared
/// memory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeSpec {
    /// Unique identifier for this node.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Focus-layer prompt for this phase.
    #[serde(default)]
    pub system_prompt: String,
    /// Keys this node expects to find in shared memory.
    #[serde(default)]
    pub input_keys: Vec<String>,
    /// Keys this node is expected to write with `set_output`.
    #[serde(default)]
    pub output_keys: Vec<String>,
    /// Output keys that may legitimately stay unset.
    #[serde(default)]
    pub nullable_output_keys: Vec<String>,
    /// Registry tool names available in this phase.
    #[serde(default)]
    pub tools: Vec<String>,
    /// Whether this phase may pause for human input.
    #[serde(default)]
    pub client_facing: bool,
    /// How many times the node may be entered. `0` means unbounded.
    #[serde(default = "default_max_node_visits")]
    pub max_node_visits: u32,
    #[serde(default)]
    pub success_criteria: Option<String>,
    /// Model turns allowed within one visit.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

fn default_max_node_visits() -> u32 {
    1
}

fn default_max_iterations() -> u32 {
    30
}

fn owned(keys: &[&str]) -> Vec<String> {
    keys.iter().map(|k| k.to_string()).collect()
}

impl NodeSpec {
    /// Create a new node with minimal configuration.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            system_prompt: String::new(),
            input_keys: vec![],
            output_keys: vec![],
            nullable_output_keys: vec![],
            tools: vec![],
            client_facing: false,
            max_node_visits: default_max_node_visits(),
            success_criteria: None,
            max_iterations: default_max_iterations(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_inputs(mut self, keys: &[&str]) -> Self {
        self.input_keys = owned(keys);
        self
    }

    pub fn with_outputs(mut self, keys: &[&str]) -> Self {
        self.output_keys = owned(keys);
        self
    }

    pub fn with_nullable_outputs(mut self, keys: &[&str]) -> Self {
        self.nullable_output_keys = owned(keys);
        self
    }

    pub fn with_tools(mut self, tools: &[&str]) -> Self {
        self.tools = owned(tools);
        self
    }

    pub fn client_facing(mut self, client_facing: bool) -> Self {
        self.client_facing = client_facing;
        self
    }

    pub fn with_max_visits(mut self, visits: u32) -> Self {
        self.max_node_visits = visits;
        self
    }

    pub fn with_max_iterations(mut self, iterations: u32) -> Self {
        self.max_iterations = iterations;
        self
    }

    pub fn with_success_criteria(mut self, criteria: impl Into<String>) -> Self {
        self.success_criteria = Some(criteria.into());
        self
    }

    /// Whether `key` is part of this node's output contract.
    pub fn declares_output(&self, key: &str) -> bool {
        self.output_keys.iter().any(|k| k == key)
            || self.nullable_output_keys.iter().any(|k| k == key)
    }

    /// Output keys that must be set before the node can finish.
    pub fn required_outputs(&self) -> impl Iterator<Item = &str> {
        self.output_keys
            .iter()
            .filter(|k| !self.nullable_output_keys.contains(k))
            .map(String::as_str)
    }

    /// Whether `visits` entries have used up this node's allowance.
    pub fn visits_exhausted(&self, visits: u32) -> bool {
        self.max_node_visits != 0 && visits >= self.max_node_visits
    }

    /// Display label: the name, or the id when the name is empty.
    pub fn label(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            tools: self.tools.clone(),
            output_keys: self.output_keys.clone(),
            client_facing: self.client_facing,
            max_node_visits: self.max_node_visits,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_builder() {
        let node = NodeSpec::new("intake", "Intake")
            .with_prompt("Collect the resume.")
            .with_outputs(&["resume_text", "role_analysis"])
            .with_nullable_outputs(&["role_analysis"])
            .with_tools(&["pdf_read"])
            .client_facing(true)
            .with_max_iterations(5);

        assert_eq!(node.max_node_visits, 1);
        assert_eq!(node.max_iterations, 5);
        assert!(node.client_facing);
        assert_eq!(node.required_outputs().collect::<Vec<_>>(), vec!["resume_text"]);
        assert!(node.declares_output("role_analysis"));
        assert!(!node.declares_output("summary"));
    }

    #[test]
    fn test_visit_ceiling() {
        let node = NodeSpec::new("a", "A");
        assert!(!node.visits_exhausted(0));
        assert!(node.visits_exhausted(1));

        let unbounded = NodeSpec::new("b", "B").with_max_visits(0);
        assert!(!unbounded.visits_exhausted(1000));
    }

    #[test]
    fn test_defaults_from_toml() {
        let node: NodeSpec = toml::from_str(
            r#"
id = "report"
name = "Report"
output_keys = ["report"]
"#,
        )
        .unwrap();
        assert_eq!(node.max_node_visits, 1);
        assert_eq!(node.max_iterations, 30);
        assert!(!node.client_facing);
        assert!(node.success_criteria.is_none());
        assert_eq!(node.snapshot().output_keys, vec!["report"]);
    }
}
