use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::session::{ConversationPart, SessionCursor, SessionMeta};
use crate::types::*;

/// LLM provider: streams one model turn.
///
/// Provider failures are reported in-band as `StreamEvent::StreamError`
/// so the engine can decide between retry and failure.
pub trait LlmProvider: Send + Sync + 'static {
    fn stream(&self, request: ModelRequest) -> BoxStream<'_, StreamEvent>;
}

/// Tool: a typed capability the model can call.
pub trait Tool: Send + Sync + 'static {
    /// Tool name (used in LLM tool calls).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// JSON Schema for tool input.
    fn input_schema(&self) -> serde_json::Value;

    /// Execute the tool. A returned object with an `"error"` key is a
    /// tool-level failure; `Err` is treated the same way by the registry.
    fn execute(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<serde_json::Value>>;

    /// Timeout in seconds for this tool.
    fn timeout_secs(&self) -> u64 {
        30
    }
}

/// Conversation store: durable per-session log of parts plus the meta and
/// cursor documents.
pub trait ConversationStore: Send + Sync + 'static {
    /// Persist one immutable part at position `seq`.
    fn write_part(&self, seq: u64, part: ConversationPart) -> BoxFuture<'_, Result<()>>;

    /// All persisted parts in ascending `seq` order. Unreadable parts are skipped.
    fn read_parts(&self) -> BoxFuture<'_, Result<Vec<ConversationPart>>>;

    fn write_meta(&self, meta: SessionMeta) -> BoxFuture<'_, Result<()>>;

    /// `Ok(None)` when no meta document has been written yet.
    fn read_meta(&self) -> BoxFuture<'_, Result<Option<SessionMeta>>>;

    fn write_cursor(&self, cursor: SessionCursor) -> BoxFuture<'_, Result<()>>;

    /// `Ok(None)` when no cursor document has been written yet.
    fn read_cursor(&self) -> BoxFuture<'_, Result<Option<SessionCursor>>>;

    /// Prune all parts with sequence number strictly below `seq`.
    /// Returns how many parts were removed.
    fn delete_parts_before(&self, seq: u64) -> BoxFuture<'_, Result<usize>>;

    /// Release resources held by the backend.
    fn close(&self) -> BoxFuture<'_, Result<()>>;

    /// Irreversibly delete everything persisted for the session.
    /// A missing target counts as success.
    fn destroy(&self) -> BoxFuture<'_, Result<()>>;
}
