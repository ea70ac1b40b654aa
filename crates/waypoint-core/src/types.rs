use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ModelConfig;
use crate::session::EscalationTicket;

/// Unique session identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A single content block in a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
}

/// A chat message sent to the provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    /// Extract all text content from this message.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// Extract all tool use blocks from this message.
    pub fn tool_uses(&self) -> Vec<(&str, &str, &serde_json::Value)> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, name, input } => {
                    Some((id.as_str(), name.as_str(), input))
                }
                _ => None,
            })
            .collect()
    }
}

/// Stop reason from the LLM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
}

/// Token counts reported with a finished turn.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Error reported by an LLM provider, with the response headers needed to
/// honor server-side retry hints.
#[derive(Debug, Clone)]
pub struct ProviderError {
    pub message: String,
    pub status: Option<u16>,
    pub headers: http::HeaderMap,
}

impl ProviderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            headers: http::HeaderMap::new(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Attach a response header. Invalid names or values are ignored.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            http::header::HeaderName::from_bytes(name.as_bytes()),
            http::header::HeaderValue::from_str(value),
        ) {
            self.headers.insert(name, value);
        }
        self
    }

    /// Look up a header as a string.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} (status {})", self.message, status),
            None => write!(f, "{}", self.message),
        }
    }
}

/// One event of a streamed model turn.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A chunk of text content.
    TextDelta(String),

    /// The current text block is complete.
    TextEnd,

    /// A complete tool call.
    ToolCall {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    /// The turn is complete.
    Finish {
        stop_reason: StopReason,
        usage: Usage,
    },

    /// The provider failed. `recoverable` decides retry vs. fail.
    StreamError {
        error: ProviderError,
        recoverable: bool,
    },
}

/// A request for one model turn.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub model: ModelConfig,
    pub system: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
}

/// Result of a tool execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }

    /// Convert a tool's JSON return value. Any object carrying an `"error"`
    /// key is a tool-level failure.
    pub fn from_value(value: serde_json::Value) -> Self {
        let is_error = value
            .as_object()
            .is_some_and(|obj| obj.contains_key("error"));
        let content = match value {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        Self { content, is_error }
    }
}

/// Tool definition for sending to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Context passed to tools during execution.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub session_id: SessionId,
    pub node_id: String,
    /// Spillover directory for large tool outputs.
    pub data_dir: PathBuf,
}

/// Agent event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    SessionStarted {
        session_id: SessionId,
        entry_point: String,
    },
    NodeEntered {
        session_id: SessionId,
        node_id: String,
        visit: u32,
    },
    TextDelta {
        session_id: SessionId,
        text: String,
    },
    ToolStart {
        session_id: SessionId,
        name: String,
        input: serde_json::Value,
    },
    ToolEnd {
        session_id: SessionId,
        name: String,
        result: ToolResult,
    },
    OutputWritten {
        session_id: SessionId,
        node_id: String,
        key: String,
        version: u64,
    },
    TurnComplete {
        session_id: SessionId,
        node_id: String,
        iteration: u64,
        usage: Usage,
    },
    RetryScheduled {
        session_id: SessionId,
        attempt: u32,
        delay_secs: f64,
        error: String,
    },
    Transition {
        session_id: SessionId,
        from: String,
        to: String,
    },
    AwaitingInput {
        session_id: SessionId,
        node_id: String,
        prompt: Option<String>,
    },
    Stalled {
        session_id: SessionId,
        ticket: EscalationTicket,
    },
    SessionComplete {
        session_id: SessionId,
        node_id: String,
    },
    SessionFailed {
        session_id: SessionId,
        error: String,
    },
}
