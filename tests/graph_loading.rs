use std::io::Write;
use std::path::PathBuf;

use waypoint_agent::{AgentDefinition, GraphSpec};
use waypoint_core::error::WaypointError;
use waypoint_tools::ToolRegistry;

fn demo(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("demos").join(name)
}

#[test]
fn test_demo_agent_builds() {
    let definition =
        AgentDefinition::load(&demo("research.toml"), ToolRegistry::with_builtins()).expect("load demo");
    let graph = &definition.graph;

    assert_eq!(graph.metadata.name, "Research Agent");
    assert_eq!(graph.entry_node("default").unwrap(), "intake");
    assert!(graph.is_terminal("report"));
    assert_eq!(definition.tools_for("research").len(), 4);
    assert!(definition.node_allows("report", "load_data"));
    assert!(!definition.node_allows("intake", "save_data"));

    let intake = graph.node("intake").unwrap();
    assert_eq!(intake.required_outputs().collect::<Vec<_>>(), vec!["topic"]);
}

#[test]
fn test_json_graph_loads_by_extension() {
    let json = serde_json::json!({
        "id": "tiny",
        "entry_points": {"start": "only"},
        "nodes": [{"id": "only", "name": "Only", "output_keys": ["answer"]}]
    });
    let mut tmp = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
    tmp.write_all(json.to_string().as_bytes()).unwrap();

    let graph = GraphSpec::load(tmp.path()).expect("load json graph");
    assert_eq!(graph.id, "tiny");
    assert_eq!(graph.entry_node("default").unwrap(), "only");
}

#[test]
fn test_unknown_tool_rejected_at_build() {
    let toml_content = r#"
id = "broken"

[entry_points]
default = "a"

[[nodes]]
id = "a"
name = "A"
output_keys = ["x"]
tools = ["send_email"]
"#;
    let mut tmp = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    tmp.write_all(toml_content.as_bytes()).unwrap();

    let err = AgentDefinition::load(tmp.path(), ToolRegistry::with_builtins()).err().unwrap();
    assert!(matches!(err, WaypointError::ToolNotFound(_)));
}

#[test]
fn test_missing_graph_file() {
    let err = GraphSpec::load(&demo("does-not-exist.toml")).unwrap_err();
    assert!(matches!(err, WaypointError::ConfigNotFound(_)));
}
