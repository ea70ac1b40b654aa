//! Persisted session records: conversation parts, the meta and cursor
//! documents, and the session state machine's externally visible states.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{SessionId, Usage};

/// One immutable, sequence-numbered record of the conversation log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationPart {
    pub seq: u64,
    /// Node that produced this part.
    pub phase_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: PartKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PartKind {
    UserText {
        text: String,
    },
    AssistantText {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
    TransitionMarker {
        from: String,
        to: String,
        text: String,
    },
}

impl ConversationPart {
    pub fn new(seq: u64, phase_id: impl Into<String>, kind: PartKind) -> Self {
        Self {
            seq,
            phase_id: phase_id.into(),
            timestamp: Utc::now(),
            kind,
        }
    }

    /// Whether this part was produced by the model.
    pub fn is_assistant(&self) -> bool {
        matches!(
            self.kind,
            PartKind::AssistantText { .. } | PartKind::ToolCall { .. }
        )
    }
}

/// Snapshot of the configuration of the node a session is currently in.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NodeSnapshot {
    pub id: String,
    pub name: String,
    pub description: String,
    pub tools: Vec<String>,
    pub output_keys: Vec<String>,
    pub client_facing: bool,
    pub max_node_visits: u32,
}

/// The meta document: which node a session is in and how it was configured.
/// Overwritten on every transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionMeta {
    pub session_id: SessionId,
    pub graph_id: String,
    pub entry_point: String,
    pub node: NodeSnapshot,
    /// Last composed system prompt.
    #[serde(default)]
    pub system_prompt: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One SharedMemory entry as persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryEntry {
    pub value: serde_json::Value,
    pub version: u64,
    /// Node that wrote the value (`None` for session input).
    #[serde(default)]
    pub written_by: Option<String>,
}

/// Persisted form of a session's SharedMemory.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MemorySnapshot {
    pub version: u64,
    pub entries: BTreeMap<String, MemoryEntry>,
}

/// Stall-detection state carried across turns.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StallTracker {
    /// Turn ends in the current node that did not satisfy the exit condition.
    pub unsatisfied_turns: u32,
    /// Required outputs still missing at the last check.
    pub last_missing: Vec<String>,
}

/// The cursor document: counters, accumulated outputs and state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionCursor {
    /// Total model turns in this session.
    pub iteration: u64,
    /// Model turns within the current visit.
    pub visit_turns: u32,
    pub node_visits: BTreeMap<String, u32>,
    pub execution_path: Vec<String>,
    pub memory: MemorySnapshot,
    /// Sequence number the next part will be written at.
    pub next_seq: u64,
    pub cumulative_tools: BTreeSet<String>,
    #[serde(default)]
    pub stall: StallTracker,
    #[serde(default)]
    pub usage: Usage,
    pub state: SessionState,
    pub updated_at: DateTime<Utc>,
}

impl SessionCursor {
    pub fn new(entry_node: impl Into<String>) -> Self {
        let entry_node = entry_node.into();
        Self {
            iteration: 0,
            visit_turns: 0,
            node_visits: BTreeMap::new(),
            execution_path: Vec::new(),
            memory: MemorySnapshot::default(),
            next_seq: 0,
            cumulative_tools: BTreeSet::new(),
            stall: StallTracker::default(),
            usage: Usage::default(),
            state: SessionState::Running {
                node_id: entry_node,
            },
            updated_at: Utc::now(),
        }
    }

    pub fn visits(&self, node_id: &str) -> u32 {
        self.node_visits.get(node_id).copied().unwrap_or(0)
    }
}

/// Externally visible session state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Running { node_id: String },
    AwaitingInput { node_id: String, prompt: Option<String> },
    Stalled { ticket: EscalationTicket },
    Terminal { node_id: String },
    Failed { error: String },
}

impl SessionState {
    /// Whether no further progress is possible without a new session.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            Self::Stalled { .. } | Self::Terminal { .. } | Self::Failed { .. }
        )
    }

    pub fn node_id(&self) -> Option<&str> {
        match self {
            Self::Running { node_id }
            | Self::AwaitingInput { node_id, .. }
            | Self::Terminal { node_id } => Some(node_id),
            Self::Stalled { ticket } => Some(&ticket.node_id),
            Self::Failed { .. } => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Running { .. } => "running",
            Self::AwaitingInput { .. } => "awaiting_input",
            Self::Stalled { .. } => "stalled",
            Self::Terminal { .. } => "terminal",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Why a node stalled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StallReason {
    /// The node's visits were used up without satisfying its output contract.
    VisitLimit,
    /// A visit ran out of model turns and no visit was left to re-prompt.
    IterationLimit,
    /// An edge pointed back into a node whose visit ceiling was reached.
    RevisitBlocked { from: String },
}

/// Escalation payload surfaced to a supervising caller when a node stalls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EscalationTicket {
    pub session_id: SessionId,
    pub node_id: String,
    pub node_name: String,
    pub visits: u32,
    pub max_node_visits: u32,
    pub missing_outputs: Vec<String>,
    pub reason: StallReason,
    /// Last assistant text produced in the node, if any.
    pub last_response: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_part_serialization_is_flat() {
        let part = ConversationPart::new(
            3,
            "intake",
            PartKind::ToolCall {
                id: "call_1".into(),
                name: "set_output".into(),
                input: serde_json::json!({"key": "x", "value": "v"}),
            },
        );
        let json = serde_json::to_value(&part).unwrap();
        assert_eq!(json["seq"], 3);
        assert_eq!(json["phase_id"], "intake");
        assert_eq!(json["kind"], "tool_call");
        assert_eq!(json["name"], "set_output");

        let parsed: ConversationPart = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, part);
        assert!(parsed.is_assistant());
    }

    #[test]
    fn test_state_helpers() {
        let state = SessionState::AwaitingInput {
            node_id: "intake".into(),
            prompt: Some("Name?".into()),
        };
        assert!(!state.is_final());
        assert_eq!(state.node_id(), Some("intake"));
        assert_eq!(state.label(), "awaiting_input");

        let failed = SessionState::Failed {
            error: "boom".into(),
        };
        assert!(failed.is_final());
        assert_eq!(failed.node_id(), None);
    }

    #[test]
    fn test_cursor_visits_default_zero() {
        let mut cursor = SessionCursor::new("a");
        assert_eq!(cursor.visits("a"), 0);
        cursor.node_visits.insert("a".into(), 2);
        assert_eq!(cursor.visits("a"), 2);
        assert!(matches!(cursor.state, SessionState::Running { ref node_id } if node_id == "a"));
    }
}
