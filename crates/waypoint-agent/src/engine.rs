use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use waypoint_core::config::{AccountsConfig, EngineConfig, ModelConfig};
use waypoint_core::error::{Result, WaypointError};
use waypoint_core::event::EventBus;
use waypoint_core::session::{EscalationTicket, PartKind, SessionState, StallReason, StallTracker};
use waypoint_core::traits::LlmProvider;
use waypoint_core::types::*;
use waypoint_llm::RetryPolicy;
use waypoint_tools::builtin::data::list_files;

use crate::control::{control_tool_definitions, is_control_tool, TurnControl};
use crate::definition::AgentDefinition;
use crate::graph::{GraphSpec, NextStep, NodeSpec};
use crate::prompt::{build_transition_marker, node_system_prompt};
use crate::session::{push_part, Session};

/// One model turn as received from the provider, in arrival order.
#[derive(Debug, Default)]
struct CompletedTurn {
    items: Vec<TurnItem>,
    stop_reason: Option<StopReason>,
    usage: Usage,
}

#[derive(Debug)]
enum TurnItem {
    Text(String),
    Call(PendingCall),
}

impl CompletedTurn {
    fn calls(&self) -> impl Iterator<Item = &PendingCall> {
        self.items.iter().filter_map(|item| match item {
            TurnItem::Call(call) => Some(call),
            TurnItem::Text(_) => None,
        })
    }

    fn has_calls(&self) -> bool {
        self.calls().next().is_some()
    }

    /// Close the text block being streamed, if any.
    fn flush_text(&mut self, text: &mut String) {
        if !text.is_empty() {
            self.items.push(TurnItem::Text(std::mem::take(text)));
        }
    }
}

#[derive(Debug)]
struct PendingCall {
    id: String,
    name: String,
    input: serde_json::Value,
}

enum Attempt {
    Done(CompletedTurn),
    Retry(ProviderError),
}

/// Drives one session through the graph until it leaves the running state.
pub struct ExecutionEngine {
    definition: Arc<AgentDefinition>,
    provider: Arc<dyn LlmProvider>,
    model: ModelConfig,
    config: EngineConfig,
    accounts: AccountsConfig,
    event_bus: Arc<EventBus>,
}

impl ExecutionEngine {
    pub fn new(
        definition: Arc<AgentDefinition>,
        provider: Arc<dyn LlmProvider>,
        model: ModelConfig,
        config: EngineConfig,
        accounts: AccountsConfig,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            definition,
            provider,
            model,
            config,
            accounts,
            event_bus,
        }
    }

    /// Run `session` until it is awaiting input, stalled, terminal or failed.
    ///
    /// Errors other than cancellation are recorded as `Failed` and returned
    /// as a state. On cancellation the turn in flight is dropped and nothing
    /// more is written.
    pub async fn run(&self, session: &mut Session, cancel: &CancellationToken) -> Result<SessionState> {
        match self.drive(session, cancel).await {
            Ok(state) => Ok(state),
            Err(WaypointError::Cancelled) => {
                info!(session_id = %session.id, "Session cancelled");
                Err(WaypointError::Cancelled)
            }
            Err(e) => {
                error!(session_id = %session.id, error = %e, "Session failed");
                session.cursor.state = SessionState::Failed {
                    error: e.to_string(),
                };
                if let Err(persist) = session.persist_cursor().await {
                    warn!(session_id = %session.id, error = %persist, "Failed to persist failed state");
                }
                self.event_bus.publish(AgentEvent::SessionFailed {
                    session_id: session.id.clone(),
                    error: e.to_string(),
                });
                Ok(session.cursor.state.clone())
            }
        }
    }

    async fn drive(&self, session: &mut Session, cancel: &CancellationToken) -> Result<SessionState> {
        let graph = self.definition.graph.clone();
        self.reconcile(session, &graph).await?;
        loop {
            let node_id = match session.state() {
                SessionState::Running { node_id } => node_id.clone(),
                other => {
                    let state = other.clone();
                    session.persist_meta().await?;
                    return Ok(state);
                }
            };
            if cancel.is_cancelled() {
                return Err(WaypointError::Cancelled);
            }
            let node = graph.node(&node_id)?;
            self.step(session, &graph, node, cancel).await?;
        }
    }

    /// Bring derived documents in line with the cursor. A session recovered
    /// after a crash may have a cursor ahead of its meta document.
    async fn reconcile(&self, session: &mut Session, graph: &GraphSpec) -> Result<()> {
        for node_id in &session.cursor.execution_path {
            if let Some(node) = graph.get_node(node_id) {
                session.cursor.cumulative_tools.extend(node.tools.iter().cloned());
            }
        }
        let Some(node_id) = session.state().node_id().map(str::to_string) else {
            return Ok(());
        };
        if session.meta.node.id != node_id {
            let node = graph.node(&node_id)?;
            debug!(session_id = %session.id, node_id = %node.id, "Refreshing stale meta");
            session.meta.node = node.snapshot();
            session.persist_meta().await?;
        }
        Ok(())
    }

    /// One model turn in `node`: stream, execute tools, commit, decide.
    async fn step(
        &self,
        session: &mut Session,
        graph: &GraphSpec,
        node: &NodeSpec,
        cancel: &CancellationToken,
    ) -> Result<()> {
        debug!(
            session_id = %session.id,
            node_id = %node.id,
            visit_turn = session.cursor.visit_turns + 1,
            "Starting turn"
        );

        let request = self.build_request(session, graph, node);
        let turn = self.stream_with_retry(&session.id, request, cancel).await?;
        debug!(
            session_id = %session.id,
            stop_reason = ?turn.stop_reason,
            tool_calls = turn.calls().count(),
            "Turn streamed"
        );

        let mut control = TurnControl::default();
        let mut results = Vec::new();
        for call in turn.calls() {
            self.event_bus.publish(AgentEvent::ToolStart {
                session_id: session.id.clone(),
                name: call.name.clone(),
                input: call.input.clone(),
            });

            let result = if is_control_tool(&call.name) {
                control.handle(
                    &call.name,
                    call.input.clone(),
                    node,
                    graph,
                    &mut session.memory,
                    self.config.output_policy,
                )
            } else if !self.definition.node_allows(&node.id, &call.name) {
                warn!(tool = %call.name, node_id = %node.id, "Tool not available in phase");
                ToolResult::error(format!(
                    "Tool '{}' is not available in phase '{}'",
                    call.name, node.id
                ))
            } else {
                let ctx = ToolContext {
                    session_id: session.id.clone(),
                    node_id: node.id.clone(),
                    data_dir: session.layout.data_dir(),
                };
                tokio::select! {
                    _ = cancel.cancelled() => return Err(WaypointError::Cancelled),
                    result = self.definition.tools.execute(&call.name, call.input.clone(), ctx) => result,
                }
            };

            self.event_bus.publish(AgentEvent::ToolEnd {
                session_id: session.id.clone(),
                name: call.name.clone(),
                result: result.clone(),
            });
            results.push(result);
        }

        // Commit the assistant side in arrival order, then the results.
        for item in &turn.items {
            let kind = match item {
                TurnItem::Text(text) => PartKind::AssistantText { text: text.clone() },
                TurnItem::Call(call) => PartKind::ToolCall {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    input: call.input.clone(),
                },
            };
            session.append(&node.id, kind).await?;
        }
        for (call, result) in turn.calls().zip(results) {
            session
                .append(
                    &node.id,
                    PartKind::ToolResult {
                        tool_use_id: call.id.clone(),
                        content: result.content,
                        is_error: result.is_error,
                    },
                )
                .await?;
        }
        for (key, version) in &control.written {
            self.event_bus.publish(AgentEvent::OutputWritten {
                session_id: session.id.clone(),
                node_id: node.id.clone(),
                key: key.clone(),
                version: *version,
            });
        }

        session.cursor.iteration += 1;
        session.cursor.visit_turns += 1;
        session.cursor.usage.input_tokens += turn.usage.input_tokens;
        session.cursor.usage.output_tokens += turn.usage.output_tokens;
        self.event_bus.publish(AgentEvent::TurnComplete {
            session_id: session.id.clone(),
            node_id: node.id.clone(),
            iteration: session.cursor.iteration,
            usage: turn.usage,
        });

        self.advance(session, graph, node, &turn, control).await?;
        session.persist_cursor().await
    }

    /// Decide what follows a committed turn.
    async fn advance(
        &self,
        session: &mut Session,
        graph: &GraphSpec,
        node: &NodeSpec,
        turn: &CompletedTurn,
        control: TurnControl,
    ) -> Result<()> {
        let visits = session.cursor.visits(&node.id);
        let step = graph.next_node(&node.id, &session.memory, visits, control.signal.as_ref())?;

        match &step {
            NextStep::Node(target) => self.enter(session, graph, node, target).await,
            NextStep::Terminal => {
                session.cursor.stall = StallTracker::default();
                session.cursor.state = SessionState::Terminal {
                    node_id: node.id.clone(),
                };
                info!(
                    session_id = %session.id,
                    node_id = %node.id,
                    iterations = session.cursor.iteration,
                    "Session complete"
                );
                self.event_bus.publish(AgentEvent::SessionComplete {
                    session_id: session.id.clone(),
                    node_id: node.id.clone(),
                });
                Ok(())
            }
            NextStep::Stalled | NextStep::Continue => {
                let missing = GraphSpec::missing_outputs(node, &session.memory);
                session.cursor.stall.unsatisfied_turns += 1;
                session.cursor.stall.last_missing = missing.clone();

                let budget_spent = session.cursor.visit_turns >= node.max_iterations;
                if !budget_spent {
                    if let Some(question) = control.question {
                        self.await_input(session, node, Some(question));
                        return Ok(());
                    }
                    if turn.has_calls() {
                        return Ok(());
                    }
                    if node.client_facing {
                        self.await_input(session, node, None);
                        return Ok(());
                    }
                }

                if step == NextStep::Stalled {
                    let reason = if budget_spent {
                        StallReason::IterationLimit
                    } else {
                        StallReason::VisitLimit
                    };
                    self.stall(session, node, reason);
                    return Ok(());
                }

                self.reprompt(session, node, &missing).await
            }
        }
    }

    /// Start a new visit of the same node with a nudge naming what is missing.
    async fn reprompt(&self, session: &mut Session, node: &NodeSpec, missing: &[String]) -> Result<()> {
        let visit = session.cursor.visits(&node.id) + 1;
        session.cursor.node_visits.insert(node.id.clone(), visit);
        session.cursor.visit_turns = 0;

        let text = if missing.is_empty() {
            format!(
                "All outputs of '{}' are recorded, but no transition applies. \
                 Review the outputs or call transition_to.",
                node.label()
            )
        } else {
            format!(
                "Phase '{}' is not finished. Required outputs still missing: {}. \
                 Record each one with set_output.",
                node.label(),
                missing.join(", ")
            )
        };
        session.append(&node.id, PartKind::UserText { text }).await?;

        info!(session_id = %session.id, node_id = %node.id, visit, "Re-prompting node");
        self.event_bus.publish(AgentEvent::NodeEntered {
            session_id: session.id.clone(),
            node_id: node.id.clone(),
            visit,
        });
        Ok(())
    }

    /// Enter `target` from `from`, unless its visit ceiling blocks the move.
    async fn enter(
        &self,
        session: &mut Session,
        graph: &GraphSpec,
        from: &NodeSpec,
        target: &str,
    ) -> Result<()> {
        let next = graph.node(target)?;
        let visits = session.cursor.visits(&next.id);
        if next.visits_exhausted(visits) {
            warn!(
                session_id = %session.id,
                from = %from.id,
                to = %next.id,
                visits,
                "Transition blocked by visit ceiling"
            );
            self.stall(
                session,
                next,
                StallReason::RevisitBlocked {
                    from: from.id.clone(),
                },
            );
            return Ok(());
        }

        let visit = visits + 1;
        session.cursor.node_visits.insert(next.id.clone(), visit);
        session.cursor.execution_path.push(next.id.clone());
        session.cursor.visit_turns = 0;
        session.cursor.stall = StallTracker::default();
        session.cursor.cumulative_tools.extend(next.tools.iter().cloned());
        session.cursor.state = SessionState::Running {
            node_id: next.id.clone(),
        };
        session.meta.node = next.snapshot();

        let adapt = session.layout.read_adapt().await;
        let files = match list_files(&session.layout.data_dir()).await {
            Ok(files) => files,
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "Could not list data files");
                Vec::new()
            }
        };
        let text = build_transition_marker(
            from,
            next,
            &session.memory,
            &session.cursor.cumulative_tools,
            &files,
            adapt.as_deref(),
        );
        let marker = session
            .append(
                &next.id,
                PartKind::TransitionMarker {
                    from: from.id.clone(),
                    to: next.id.clone(),
                    text,
                },
            )
            .await?;

        if self.config.prune_on_transition {
            // The pruned parts may hold this turn's outputs; the cursor has
            // to carry them before the parts go.
            session.persist_cursor().await?;
            let removed = session.store.delete_parts_before(marker.seq).await?;
            session.history.clear();
            push_part(&mut session.history, &marker);
            debug!(session_id = %session.id, removed, "Pruned parts before transition");
        }
        session.persist_meta().await?;

        info!(session_id = %session.id, from = %from.id, to = %next.id, visit, "Transition");
        self.event_bus.publish(AgentEvent::Transition {
            session_id: session.id.clone(),
            from: from.id.clone(),
            to: next.id.clone(),
        });
        self.event_bus.publish(AgentEvent::NodeEntered {
            session_id: session.id.clone(),
            node_id: next.id.clone(),
            visit,
        });
        Ok(())
    }

    fn await_input(&self, session: &mut Session, node: &NodeSpec, prompt: Option<String>) {
        info!(session_id = %session.id, node_id = %node.id, "Awaiting user input");
        self.event_bus.publish(AgentEvent::AwaitingInput {
            session_id: session.id.clone(),
            node_id: node.id.clone(),
            prompt: prompt.clone(),
        });
        session.cursor.state = SessionState::AwaitingInput {
            node_id: node.id.clone(),
            prompt,
        };
    }

    fn stall(&self, session: &mut Session, node: &NodeSpec, reason: StallReason) {
        let ticket = EscalationTicket {
            session_id: session.id.clone(),
            node_id: node.id.clone(),
            node_name: node.label().to_string(),
            visits: session.cursor.visits(&node.id),
            max_node_visits: node.max_node_visits,
            missing_outputs: GraphSpec::missing_outputs(node, &session.memory),
            reason,
            last_response: session.last_response(),
            created_at: Utc::now(),
        };
        warn!(
            session_id = %session.id,
            node_id = %node.id,
            visits = ticket.visits,
            missing = ?ticket.missing_outputs,
            reason = ?ticket.reason,
            "Node stalled, escalating"
        );
        self.event_bus.publish(AgentEvent::Stalled {
            session_id: session.id.clone(),
            ticket: ticket.clone(),
        });
        session.cursor.state = SessionState::Stalled { ticket };
    }

    fn build_request(&self, session: &mut Session, graph: &GraphSpec, node: &NodeSpec) -> ModelRequest {
        let system = node_system_prompt(
            graph,
            node,
            &session.memory,
            &session.cursor.execution_path,
            &self.accounts,
        );
        session.meta.system_prompt = system.clone();

        let mut tools = self.definition.tools_for(&node.id).to_vec();
        tools.extend(control_tool_definitions(node, graph));

        ModelRequest {
            model: self.model.clone(),
            system,
            messages: session.history.clone(),
            tools,
        }
    }

    async fn stream_with_retry(
        &self,
        session_id: &SessionId,
        request: ModelRequest,
        cancel: &CancellationToken,
    ) -> Result<CompletedTurn> {
        let policy = RetryPolicy::from(&self.config.retry);
        let mut attempt: u32 = 0;

        loop {
            let err = match self.stream_once(session_id, request.clone(), cancel).await? {
                Attempt::Done(turn) => return Ok(turn),
                Attempt::Retry(err) => err,
            };

            if !policy.should_retry(attempt) {
                return Err(WaypointError::RetriesExhausted {
                    attempts: attempt + 1,
                    last_error: err.to_string(),
                });
            }

            let delay = policy.delay(attempt, Some(&err));
            warn!(
                session_id = %session_id,
                attempt = attempt + 1,
                delay_secs = delay.as_secs_f64(),
                error = %err,
                "Model call failed, retrying"
            );
            self.event_bus.publish(AgentEvent::RetryScheduled {
                session_id: session_id.clone(),
                attempt: attempt + 1,
                delay_secs: delay.as_secs_f64(),
                error: err.to_string(),
            });

            tokio::select! {
                _ = cancel.cancelled() => return Err(WaypointError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    async fn stream_once(
        &self,
        session_id: &SessionId,
        request: ModelRequest,
        cancel: &CancellationToken,
    ) -> Result<Attempt> {
        let idle_secs = self.config.stream_idle_timeout_secs;
        let idle = Duration::from_secs(idle_secs);
        let mut stream = self.provider.stream(request);

        let mut turn = CompletedTurn::default();
        let mut text = String::new();

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Err(WaypointError::Cancelled),
                next = tokio::time::timeout(idle, stream.next()) => next,
            };

            let event = match next {
                Err(_) => {
                    return Ok(Attempt::Retry(ProviderError::new(
                        WaypointError::StreamTimeout(idle_secs).to_string(),
                    )))
                }
                Ok(None) => {
                    return Ok(Attempt::Retry(ProviderError::new(
                        "stream ended before the turn finished",
                    )))
                }
                Ok(Some(event)) => event,
            };

            match event {
                StreamEvent::TextDelta(delta) => {
                    self.event_bus.publish(AgentEvent::TextDelta {
                        session_id: session_id.clone(),
                        text: delta.clone(),
                    });
                    text.push_str(&delta);
                }
                StreamEvent::TextEnd => turn.flush_text(&mut text),
                StreamEvent::ToolCall { id, name, input } => {
                    let id = if id.is_empty() {
                        format!("call_{}", uuid::Uuid::new_v4().simple())
                    } else {
                        id
                    };
                    debug!(session_id = %session_id, tool = %name, "Tool call received");
                    turn.flush_text(&mut text);
                    turn.items.push(TurnItem::Call(PendingCall { id, name, input }));
                }
                StreamEvent::Finish { stop_reason, usage } => {
                    turn.flush_text(&mut text);
                    turn.stop_reason = Some(stop_reason);
                    turn.usage = usage;
                    return Ok(Attempt::Done(turn));
                }
                StreamEvent::StreamError { error, recoverable } => {
                    if recoverable {
                        return Ok(Attempt::Retry(error));
                    }
                    return Err(WaypointError::Provider(error));
                }
            }
        }
    }
}
