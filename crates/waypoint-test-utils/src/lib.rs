//! Shared test utilities: a scripted LLM provider, an event recorder and
//! small tool fixtures.

use std::collections::VecDeque;
use std::sync::Mutex;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::json;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::broadcast::Receiver;

use waypoint_core::error::Result;
use waypoint_core::event::EventBus;
use waypoint_core::traits::{LlmProvider, Tool};
use waypoint_core::types::{AgentEvent, ModelRequest, StreamEvent, ToolContext};

/// One scripted provider response.
#[derive(Debug, Clone)]
pub enum ScriptedTurn {
    /// Emit these events, then end the stream.
    Events(Vec<StreamEvent>),
    /// Never produce an event.
    Hang,
}

/// Builders for common scripted turns.
pub mod turn {
    use super::ScriptedTurn;
    use waypoint_core::types::{ProviderError, StopReason, StreamEvent, Usage};

    fn usage() -> Usage {
        Usage {
            input_tokens: 10,
            output_tokens: 5,
        }
    }

    /// A plain text answer that ends the turn.
    pub fn text(text: &str) -> ScriptedTurn {
        ScriptedTurn::Events(vec![
            StreamEvent::TextDelta(text.to_string()),
            StreamEvent::TextEnd,
            StreamEvent::Finish {
                stop_reason: StopReason::EndTurn,
                usage: usage(),
            },
        ])
    }

    /// Tool calls (`StreamEvent::ToolCall`) followed by a tool-use finish.
    pub fn tool_use(calls: Vec<StreamEvent>) -> ScriptedTurn {
        let mut events = calls;
        events.push(StreamEvent::Finish {
            stop_reason: StopReason::ToolUse,
            usage: usage(),
        });
        ScriptedTurn::Events(events)
    }

    /// A provider failure.
    pub fn error(message: &str, recoverable: bool) -> ScriptedTurn {
        ScriptedTurn::Events(vec![StreamEvent::StreamError {
            error: ProviderError::new(message),
            recoverable,
        }])
    }

    pub fn hang() -> ScriptedTurn {
        ScriptedTurn::Hang
    }
}

/// LLM provider that replays a fixed script, one entry per model call,
/// and records every request it receives.
pub struct ScriptedProvider {
    script: Mutex<VecDeque<ScriptedTurn>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedProvider {
    pub fn new(script: Vec<ScriptedTurn>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Requests received so far, in call order.
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Scripted turns not yet consumed.
    pub fn remaining(&self) -> usize {
        self.script.lock().unwrap().len()
    }
}

impl LlmProvider for ScriptedProvider {
    fn stream(&self, request: ModelRequest) -> BoxStream<'_, StreamEvent> {
        self.requests.lock().unwrap().push(request);
        match self.script.lock().unwrap().pop_front() {
            Some(ScriptedTurn::Events(events)) => stream::iter(events).boxed(),
            Some(ScriptedTurn::Hang) => stream::pending().boxed(),
            None => stream::iter(vec![StreamEvent::StreamError {
                error: waypoint_core::types::ProviderError::new("script exhausted"),
                recoverable: false,
            }])
            .boxed(),
        }
    }
}

/// Records events published on an [`EventBus`].
pub struct EventLog {
    rx: Mutex<Receiver<AgentEvent>>,
    seen: Mutex<Vec<AgentEvent>>,
}

impl EventLog {
    /// Subscribe to `bus`. Only events published afterwards are recorded.
    pub fn attach(bus: &EventBus) -> Self {
        Self {
            rx: Mutex::new(bus.subscribe()),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// All events received so far.
    pub fn events(&self) -> Vec<AgentEvent> {
        let mut rx = self.rx.lock().unwrap();
        let mut seen = self.seen.lock().unwrap();
        loop {
            match rx.try_recv() {
                Ok(event) => seen.push(event),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        seen.clone()
    }

    pub fn count(&self, predicate: impl Fn(&AgentEvent) -> bool) -> usize {
        self.events().iter().filter(|e| predicate(e)).count()
    }
}

/// Tool that returns its input under `"echo"`.
pub struct EchoTool;

impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the input back."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({"type": "object"})
    }

    fn execute(
        &self,
        input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<serde_json::Value>> {
        Box::pin(async move { Ok(json!({ "echo": input })) })
    }
}
