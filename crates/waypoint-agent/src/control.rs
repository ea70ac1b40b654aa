//! Control tools: calls the engine handles itself instead of dispatching to
//! the tool registry. They write outputs, pause for the user, and steer the
//! graph.

use serde::Deserialize;
use serde_json::json;

use waypoint_core::config::OutputPolicy;
use waypoint_core::error::WaypointError;
use waypoint_core::types::{ToolDefinition, ToolResult};

use crate::graph::{GraphSpec, NodeSpec, ToolSignal};
use crate::memory::SharedMemory;

pub const SET_OUTPUT: &str = "set_output";
pub const ASK_USER: &str = "ask_user";
pub const TRANSITION_TO: &str = "transition_to";
pub const COMPLETE_SESSION: &str = "complete_session";

pub fn is_control_tool(name: &str) -> bool {
    matches!(name, SET_OUTPUT | ASK_USER | TRANSITION_TO | COMPLETE_SESSION)
}

/// Control tools offered to the model while `node` is active.
pub fn control_tool_definitions(node: &NodeSpec, graph: &GraphSpec) -> Vec<ToolDefinition> {
    let mut defs = Vec::new();

    if !node.output_keys.is_empty() || !node.nullable_output_keys.is_empty() {
        let mut keys: Vec<&str> = node.output_keys.iter().map(String::as_str).collect();
        for key in &node.nullable_output_keys {
            if !keys.contains(&key.as_str()) {
                keys.push(key);
            }
        }
        defs.push(ToolDefinition {
            name: SET_OUTPUT.into(),
            description: "Record one of this phase's outputs in shared memory. Later calls \
                          with the same key replace the earlier value."
                .into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "key": { "type": "string", "enum": keys, "description": "Output key" },
                    "value": { "description": "Output value (any JSON)" }
                },
                "required": ["key", "value"]
            }),
        });
    }

    if node.client_facing {
        defs.push(ToolDefinition {
            name: ASK_USER.into(),
            description: "Pause and wait for the user to answer a question.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "question": { "type": "string", "description": "What to ask the user" }
                },
                "required": ["question"]
            }),
        });
    }

    let targets: Vec<&str> = graph.outgoing(&node.id).map(|e| e.to.as_str()).collect();
    if targets.is_empty() {
        defs.push(ToolDefinition {
            name: COMPLETE_SESSION.into(),
            description: "Finish the session once every required output is recorded.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "summary": { "type": "string", "description": "Short summary of the result" }
                },
                "required": ["summary"]
            }),
        });
    } else {
        let mut unique = targets;
        unique.sort_unstable();
        unique.dedup();
        defs.push(ToolDefinition {
            name: TRANSITION_TO.into(),
            description: "Move to another phase immediately.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "node": { "type": "string", "enum": unique, "description": "Target phase id" },
                    "reason": { "type": "string", "description": "Why the hand-off happens now" }
                },
                "required": ["node"]
            }),
        });
    }

    defs
}

#[derive(Deserialize)]
struct SetOutputInput {
    key: String,
    value: serde_json::Value,
}

#[derive(Deserialize)]
struct AskUserInput {
    question: String,
}

#[derive(Deserialize)]
struct TransitionInput {
    node: String,
    #[serde(default)]
    reason: String,
}

#[derive(Deserialize)]
struct CompleteInput {
    #[serde(default)]
    summary: String,
}

fn parse<T: for<'de> Deserialize<'de>>(tool: &str, input: serde_json::Value) -> Result<T, ToolResult> {
    serde_json::from_value(input).map_err(|e| {
        ToolResult::error(WaypointError::ToolValidation(format!("{}: {}", tool, e)).to_string())
    })
}

/// Effects of the control calls made during one model turn.
#[derive(Debug, Default)]
pub struct TurnControl {
    /// First accepted steering signal of the turn.
    pub signal: Option<ToolSignal>,
    /// Question passed to `ask_user`, if it was called.
    pub question: Option<String>,
    /// `(key, version)` for every accepted `set_output`.
    pub written: Vec<(String, u64)>,
}

impl TurnControl {
    pub fn asked_user(&self) -> bool {
        self.question.is_some()
    }

    /// Apply one control call and produce the result returned to the model.
    pub fn handle(
        &mut self,
        name: &str,
        input: serde_json::Value,
        node: &NodeSpec,
        graph: &GraphSpec,
        memory: &mut SharedMemory,
        policy: OutputPolicy,
    ) -> ToolResult {
        match name {
            SET_OUTPUT => {
                let params: SetOutputInput = match parse(name, input) {
                    Ok(p) => p,
                    Err(result) => return result,
                };
                match memory.write_checked(node, &params.key, params.value, policy) {
                    Ok(version) => {
                        self.written.push((params.key.clone(), version));
                        let missing = GraphSpec::missing_outputs(node, memory);
                        if missing.is_empty() {
                            ToolResult::success(format!(
                                "Recorded '{}'. All required outputs are set.",
                                params.key
                            ))
                        } else {
                            ToolResult::success(format!(
                                "Recorded '{}'. Still missing: {}",
                                params.key,
                                missing.join(", ")
                            ))
                        }
                    }
                    Err(e) => ToolResult::error(e.to_string()),
                }
            }
            ASK_USER => {
                if !node.client_facing {
                    return ToolResult::error(format!(
                        "Phase '{}' cannot wait for user input; continue on your own.",
                        node.id
                    ));
                }
                let params: AskUserInput = match parse(name, input) {
                    Ok(p) => p,
                    Err(result) => return result,
                };
                self.question = Some(params.question);
                ToolResult::success("Waiting for the user to reply.")
            }
            TRANSITION_TO => {
                let params: TransitionInput = match parse(name, input) {
                    Ok(p) => p,
                    Err(result) => return result,
                };
                if self.signal.is_some() {
                    return ToolResult::error("A hand-off is already pending for this turn.");
                }
                if !graph.outgoing(&node.id).any(|e| e.to == params.node) {
                    let targets: Vec<&str> =
                        graph.outgoing(&node.id).map(|e| e.to.as_str()).collect();
                    return ToolResult::error(format!(
                        "Cannot move from '{}' to '{}'. Valid targets: {}",
                        node.id,
                        params.node,
                        if targets.is_empty() {
                            "none".to_string()
                        } else {
                            targets.join(", ")
                        }
                    ));
                }
                let target = params.node.clone();
                self.signal = Some(ToolSignal::Goto {
                    target: params.node,
                    reason: params.reason,
                });
                ToolResult::success(format!("Moving to '{}' after this turn.", target))
            }
            COMPLETE_SESSION => {
                let params: CompleteInput = match parse(name, input) {
                    Ok(p) => p,
                    Err(result) => return result,
                };
                if graph.has_outgoing(&node.id) {
                    return ToolResult::error(format!(
                        "Phase '{}' is not a final phase; use transition_to instead.",
                        node.id
                    ));
                }
                let missing = GraphSpec::missing_outputs(node, memory);
                if !missing.is_empty() {
                    return ToolResult::error(format!(
                        "Cannot complete yet. Missing outputs: {}",
                        missing.join(", ")
                    ));
                }
                if self.signal.is_some() {
                    return ToolResult::error("A hand-off is already pending for this turn.");
                }
                self.signal = Some(ToolSignal::Complete {
                    summary: params.summary,
                });
                ToolResult::success("Session will complete after this turn.")
            }
            other => ToolResult::error(format!("Unknown control tool: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::graph::EdgeSpec;

    fn graph() -> GraphSpec {
        GraphSpec {
            id: "g".into(),
            metadata: Default::default(),
            identity_prompt: String::new(),
            nodes: vec![
                NodeSpec::new("intake", "Intake")
                    .with_outputs(&["topic"])
                    .client_facing(true),
                NodeSpec::new("report", "Report").with_outputs(&["report"]),
            ],
            edges: vec![EdgeSpec::always("intake", "report")],
            entry_points: BTreeMap::from([("default".to_string(), "intake".to_string())]),
            terminal_nodes: vec![],
        }
    }

    fn names(defs: &[ToolDefinition]) -> Vec<&str> {
        defs.iter().map(|d| d.name.as_str()).collect()
    }

    #[test]
    fn test_definitions_per_node() {
        let graph = graph();
        let intake = control_tool_definitions(graph.node("intake").unwrap(), &graph);
        assert_eq!(names(&intake), vec![SET_OUTPUT, ASK_USER, TRANSITION_TO]);

        let report = control_tool_definitions(graph.node("report").unwrap(), &graph);
        assert_eq!(names(&report), vec![SET_OUTPUT, COMPLETE_SESSION]);
        assert!(is_control_tool("ask_user"));
        assert!(!is_control_tool("load_data"));
    }

    #[test]
    fn test_set_output() {
        let graph = graph();
        let node = graph.node("intake").unwrap();
        let mut memory = SharedMemory::new();
        let mut control = TurnControl::default();

        let ok = control.handle(
            SET_OUTPUT,
            json!({"key": "topic", "value": "rust"}),
            node,
            &graph,
            &mut memory,
            OutputPolicy::Strict,
        );
        assert!(!ok.is_error);
        assert!(ok.content.contains("All required outputs are set"));
        assert_eq!(control.written, vec![("topic".to_string(), 1)]);

        let rejected = control.handle(
            SET_OUTPUT,
            json!({"key": "bogus", "value": 1}),
            node,
            &graph,
            &mut memory,
            OutputPolicy::Strict,
        );
        assert!(rejected.is_error);

        let malformed = control.handle(
            SET_OUTPUT,
            json!({"value": 1}),
            node,
            &graph,
            &mut memory,
            OutputPolicy::Strict,
        );
        assert!(malformed.is_error);
        assert_eq!(control.written.len(), 1);
    }

    #[test]
    fn test_ask_user_only_client_facing() {
        let graph = graph();
        let mut memory = SharedMemory::new();
        let mut control = TurnControl::default();

        let refused = control.handle(
            ASK_USER,
            json!({"question": "?"}),
            graph.node("report").unwrap(),
            &graph,
            &mut memory,
            OutputPolicy::Strict,
        );
        assert!(refused.is_error);
        assert!(!control.asked_user());

        control.handle(
            ASK_USER,
            json!({"question": "Which topic?"}),
            graph.node("intake").unwrap(),
            &graph,
            &mut memory,
            OutputPolicy::Strict,
        );
        assert_eq!(control.question.as_deref(), Some("Which topic?"));
    }

    #[test]
    fn test_transition_targets_checked() {
        let graph = graph();
        let node = graph.node("intake").unwrap();
        let mut memory = SharedMemory::new();
        let mut control = TurnControl::default();

        let bad = control.handle(
            TRANSITION_TO,
            json!({"node": "nowhere"}),
            node,
            &graph,
            &mut memory,
            OutputPolicy::Strict,
        );
        assert!(bad.is_error);
        assert!(bad.content.contains("Valid targets: report"));
        assert!(control.signal.is_none());

        control.handle(
            TRANSITION_TO,
            json!({"node": "report", "reason": "user is done"}),
            node,
            &graph,
            &mut memory,
            OutputPolicy::Strict,
        );
        assert_eq!(
            control.signal,
            Some(ToolSignal::Goto {
                target: "report".into(),
                reason: "user is done".into()
            })
        );
    }

    #[test]
    fn test_complete_requires_outputs_and_final_node() {
        let graph = graph();
        let mut memory = SharedMemory::new();
        let mut control = TurnControl::default();

        let not_final = control.handle(
            COMPLETE_SESSION,
            json!({"summary": "x"}),
            graph.node("intake").unwrap(),
            &graph,
            &mut memory,
            OutputPolicy::Strict,
        );
        assert!(not_final.is_error);

        let report = graph.node("report").unwrap();
        let early = control.handle(
            COMPLETE_SESSION,
            json!({"summary": "x"}),
            report,
            &graph,
            &mut memory,
            OutputPolicy::Strict,
        );
        assert!(early.content.contains("Missing outputs: report"));

        memory.write("report", json!("final"), Some("report"));
        let done = control.handle(
            COMPLETE_SESSION,
            json!({"summary": "all good"}),
            report,
            &graph,
            &mut memory,
            OutputPolicy::Strict,
        );
        assert!(!done.is_error);
        assert!(matches!(control.signal, Some(ToolSignal::Complete { .. })));
    }
}
