use thiserror::Error;

use crate::types::ProviderError;

#[derive(Debug, Error)]
pub enum WaypointError {
    // Provider errors
    #[error("LLM provider error: {0}")]
    Provider(ProviderError),

    #[error("LLM provider failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("LLM stream idle for more than {0}s")]
    StreamTimeout(u64),

    // Tool errors
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Tool timeout after {timeout_secs}s: {tool}")]
    ToolTimeout { tool: String, timeout_secs: u64 },

    #[error("Tool input validation failed: {0}")]
    ToolValidation(String),

    // Graph / contract errors
    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Output contract violated in node {node}: {message}")]
    OutputContract { node: String, message: String },

    // Session errors
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session {0} already has an active task")]
    SessionBusy(String),

    #[error("Invalid session state: {0}")]
    InvalidState(String),

    #[error("Session cancelled")]
    Cancelled,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WaypointError {
    /// Configuration errors are fatal at session start and never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::ConfigNotFound(_)
                | Self::InvalidGraph(_)
                | Self::NodeNotFound(_)
                | Self::ToolNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, WaypointError>;
