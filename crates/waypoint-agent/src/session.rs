//! A live session: persisted documents, in-memory history and the store
//! they are written through.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use waypoint_core::error::{Result, WaypointError};
use waypoint_core::session::{
    ConversationPart, PartKind, SessionCursor, SessionMeta, SessionState, StallTracker,
};
use waypoint_core::traits::ConversationStore;
use waypoint_core::types::{ChatMessage, ContentBlock, Role, SessionId};
use waypoint_store::SessionLayout;

use crate::control::SET_OUTPUT;
use crate::graph::{GraphSpec, NodeSpec};
use crate::memory::SharedMemory;

/// Result text given to tool calls whose result was never persisted.
pub const INTERRUPTED_RESULT: &str = "interrupted: the session stopped before this tool returned";

pub struct Session {
    pub id: SessionId,
    pub layout: SessionLayout,
    pub store: Arc<dyn ConversationStore>,
    pub meta: SessionMeta,
    pub cursor: SessionCursor,
    pub memory: SharedMemory,
    /// Chat history sent to the model, rebuilt from parts on load.
    pub history: Vec<ChatMessage>,
}

impl Session {
    /// Create a session at `entry_point`, seed memory with `input` and write
    /// the first user part.
    pub async fn create(
        id: SessionId,
        layout: SessionLayout,
        store: Arc<dyn ConversationStore>,
        graph: &GraphSpec,
        entry_point: &str,
        input: serde_json::Map<String, serde_json::Value>,
        message: Option<String>,
    ) -> Result<Self> {
        let entry = graph.node(graph.entry_node(entry_point)?)?;

        let mut memory = SharedMemory::new();
        memory.seed(input);

        let mut cursor = SessionCursor::new(&entry.id);
        cursor.node_visits.insert(entry.id.clone(), 1);
        cursor.execution_path.push(entry.id.clone());
        cursor.cumulative_tools.extend(entry.tools.iter().cloned());
        cursor.memory = memory.snapshot();

        let now = Utc::now();
        let meta = SessionMeta {
            session_id: id.clone(),
            graph_id: graph.id.clone(),
            entry_point: entry_point.to_string(),
            node: entry.snapshot(),
            system_prompt: String::new(),
            created_at: now,
            updated_at: now,
        };

        let mut session = Self {
            id,
            layout,
            store,
            meta,
            cursor,
            memory,
            history: Vec::new(),
        };

        let text = message.unwrap_or_else(|| kickoff_message(entry, &session.memory));
        session.append(&entry.id, PartKind::UserText { text }).await?;
        session.persist_meta().await?;
        session.persist_cursor().await?;

        debug!(session_id = %session.id, node_id = %entry.id, "Session created");
        Ok(session)
    }

    /// Load a session previously written by `create`.
    pub async fn load(
        id: SessionId,
        layout: SessionLayout,
        store: Arc<dyn ConversationStore>,
    ) -> Result<Self> {
        let meta = store
            .read_meta()
            .await?
            .ok_or_else(|| WaypointError::SessionNotFound(id.to_string()))?;
        let mut cursor = store.read_cursor().await?.ok_or_else(|| {
            WaypointError::InvalidState(format!("session {} has no cursor document", id))
        })?;

        let parts = store.read_parts().await?;
        let mut memory = SharedMemory::restore(cursor.memory.clone());

        // A crash between a part write and the cursor write leaves the
        // cursor behind the log.
        let tail_start = parts.partition_point(|p| p.seq < cursor.next_seq);
        let tail = &parts[tail_start..];
        if let Some(last) = tail.last() {
            warn!(
                session_id = %id,
                from_seq = cursor.next_seq,
                last_seq = last.seq,
                "Cursor behind part log, replaying"
            );
            replay_tail(&mut cursor, &mut memory, tail);
            cursor.next_seq = last.seq + 1;
            cursor.memory = memory.snapshot();
            cursor.updated_at = Utc::now();
            store.write_cursor(cursor.clone()).await?;
        }

        let history = rebuild_history(&parts);
        debug!(session_id = %id, parts = parts.len(), state = cursor.state.label(), "Session loaded");

        Ok(Self {
            id,
            layout,
            store,
            meta,
            cursor,
            memory,
            history,
        })
    }

    pub fn state(&self) -> &SessionState {
        &self.cursor.state
    }

    /// Persist one part at the next sequence number and mirror it into the
    /// chat history.
    pub async fn append(&mut self, phase_id: &str, kind: PartKind) -> Result<ConversationPart> {
        let part = ConversationPart::new(self.cursor.next_seq, phase_id, kind);
        self.store.write_part(part.seq, part.clone()).await?;
        self.cursor.next_seq = part.seq + 1;
        push_part(&mut self.history, &part);
        Ok(part)
    }

    /// Accept a user reply. Only running or awaiting sessions take input.
    pub async fn submit_user_input(&mut self, text: Option<String>) -> Result<()> {
        let node_id = match &self.cursor.state {
            SessionState::AwaitingInput { node_id, .. } | SessionState::Running { node_id } => {
                node_id.clone()
            }
            other => {
                return Err(WaypointError::InvalidState(format!(
                    "session {} is {} and cannot take input",
                    self.id,
                    other.label()
                )))
            }
        };

        if let Some(text) = text.filter(|t| !t.trim().is_empty()) {
            self.append(&node_id, PartKind::UserText { text }).await?;
        }
        self.cursor.state = SessionState::Running { node_id };
        self.persist_cursor().await
    }

    pub async fn persist_cursor(&mut self) -> Result<()> {
        self.cursor.memory = self.memory.snapshot();
        self.cursor.updated_at = Utc::now();
        self.store.write_cursor(self.cursor.clone()).await
    }

    pub async fn persist_meta(&mut self) -> Result<()> {
        self.meta.updated_at = Utc::now();
        self.store.write_meta(self.meta.clone()).await
    }

    /// Most recent non-empty assistant text.
    pub fn last_response(&self) -> Option<String> {
        self.history
            .iter()
            .rev()
            .filter(|m| m.role == Role::Assistant)
            .map(ChatMessage::text)
            .find(|t| !t.trim().is_empty())
    }
}

/// First user message when the caller supplied none: the entry node's
/// declared inputs as found in memory.
fn kickoff_message(node: &NodeSpec, memory: &SharedMemory) -> String {
    let lines: Vec<String> = node
        .input_keys
        .iter()
        .filter_map(|k| {
            memory.read(k).filter(|v| !v.is_null()).map(|v| match v {
                serde_json::Value::String(s) => format!("{}: {}", k, s),
                other => format!("{}: {}", k, other),
            })
        })
        .collect();
    if lines.is_empty() {
        "Begin.".to_string()
    } else {
        lines.join("\n")
    }
}

/// Fold parts the cursor has not seen into cursor and memory.
///
/// The tail holds at most one uncommitted turn plus what followed it: a
/// re-prompt nudge or a transition marker. A user part with no assistant part
/// before it is a reply accepted just before the crash.
fn replay_tail(cursor: &mut SessionCursor, memory: &mut SharedMemory, tail: &[ConversationPart]) {
    let mut outputs: HashMap<&str, (&str, &serde_json::Value)> = HashMap::new();
    let mut in_turn = false;

    for part in tail {
        match &part.kind {
            PartKind::AssistantText { .. } | PartKind::ToolCall { .. } if !in_turn => {
                in_turn = true;
                cursor.iteration += 1;
                cursor.visit_turns += 1;
            }
            _ => {}
        }

        match &part.kind {
            PartKind::ToolCall { id, name, input } if name == SET_OUTPUT => {
                if let Some(key) = input.get("key").and_then(|k| k.as_str()) {
                    let value = input.get("value").unwrap_or(&serde_json::Value::Null);
                    outputs.insert(id.as_str(), (key, value));
                }
            }
            PartKind::ToolResult {
                tool_use_id,
                is_error: false,
                ..
            } => {
                if let Some((key, value)) = outputs.remove(tool_use_id.as_str()) {
                    memory.write(key, value.clone(), Some(part.phase_id.as_str()));
                }
            }
            PartKind::UserText { .. } if in_turn => {
                let visit = cursor.visits(&part.phase_id) + 1;
                cursor.node_visits.insert(part.phase_id.clone(), visit);
                cursor.visit_turns = 0;
            }
            PartKind::UserText { .. } => {
                cursor.state = SessionState::Running {
                    node_id: part.phase_id.clone(),
                };
            }
            PartKind::TransitionMarker { to, .. } => {
                let visit = cursor.visits(to) + 1;
                cursor.node_visits.insert(to.clone(), visit);
                cursor.execution_path.push(to.clone());
                cursor.visit_turns = 0;
                cursor.stall = StallTracker::default();
                cursor.state = SessionState::Running { node_id: to.clone() };
            }
            _ => {}
        }
    }
}

fn part_block(kind: &PartKind) -> (Role, ContentBlock) {
    match kind {
        PartKind::UserText { text } => (Role::User, ContentBlock::Text { text: text.clone() }),
        PartKind::TransitionMarker { text, .. } => {
            (Role::User, ContentBlock::Text { text: text.clone() })
        }
        PartKind::AssistantText { text } => {
            (Role::Assistant, ContentBlock::Text { text: text.clone() })
        }
        PartKind::ToolCall { id, name, input } => (
            Role::Assistant,
            ContentBlock::ToolUse {
                id: id.clone(),
                name: name.clone(),
                input: input.clone(),
            },
        ),
        PartKind::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => (
            Role::User,
            ContentBlock::ToolResult {
                tool_use_id: tool_use_id.clone(),
                content: content.clone(),
                is_error: *is_error,
            },
        ),
    }
}

/// Append a part to `history`, merging into the last message when the role
/// matches.
pub fn push_part(history: &mut Vec<ChatMessage>, part: &ConversationPart) {
    let (role, block) = part_block(&part.kind);
    match history.last_mut() {
        Some(last) if last.role == role => last.content.push(block),
        _ => history.push(ChatMessage {
            role,
            content: vec![block],
        }),
    }
}

/// Rebuild the chat history from persisted parts.
///
/// Tool calls whose result part never made it to disk get a synthetic error
/// result so the provider sees a well-formed exchange.
pub fn rebuild_history(parts: &[ConversationPart]) -> Vec<ChatMessage> {
    let mut history: Vec<ChatMessage> = Vec::new();
    for part in parts {
        push_part(&mut history, part);
    }

    let mut i = 0;
    while i < history.len() {
        if history[i].role != Role::Assistant {
            i += 1;
            continue;
        }
        let call_ids: Vec<String> = history[i]
            .tool_uses()
            .into_iter()
            .map(|(id, _, _)| id.to_string())
            .collect();
        if call_ids.is_empty() {
            i += 1;
            continue;
        }

        let answered: Vec<String> = match history.get(i + 1) {
            Some(next) if next.role == Role::User => next
                .content
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.clone()),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        };
        let repairs: Vec<ContentBlock> = call_ids
            .into_iter()
            .filter(|id| !answered.contains(id))
            .map(|id| ContentBlock::ToolResult {
                tool_use_id: id,
                content: INTERRUPTED_RESULT.to_string(),
                is_error: true,
            })
            .collect();

        if !repairs.is_empty() {
            warn!(count = repairs.len(), "Repairing tool calls without results");
            match history.get_mut(i + 1) {
                Some(next) if next.role == Role::User => {
                    // Results lead the user message.
                    let rest = std::mem::take(&mut next.content);
                    next.content = repairs;
                    next.content.extend(rest);
                }
                _ => history.insert(
                    i + 1,
                    ChatMessage {
                        role: Role::User,
                        content: repairs,
                    },
                ),
            }
        }
        i += 1;
    }

    history
}
