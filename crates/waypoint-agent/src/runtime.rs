use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use waypoint_core::config::{AppConfig, StorageBackend};
use waypoint_core::error::{Result, WaypointError};
use waypoint_core::event::EventBus;
use waypoint_core::session::SessionState;
use waypoint_core::traits::{ConversationStore, LlmProvider};
use waypoint_core::types::{AgentEvent, SessionId};
use waypoint_store::{list_session_ids, open_store, SessionLayout};

use crate::definition::AgentDefinition;
use crate::engine::ExecutionEngine;
use crate::session::Session;

struct ActiveSession {
    cancel: CancellationToken,
    /// Taken by `wait` while it awaits the task.
    handle: Option<JoinHandle<Result<SessionState>>>,
}

impl ActiveSession {
    fn is_running(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| !h.is_finished())
    }
}

/// Hosts sessions of one agent definition. Each session runs on its own
/// tokio task; between tasks a session lives only in its store.
pub struct AgentRuntime {
    engine: Arc<ExecutionEngine>,
    definition: Arc<AgentDefinition>,
    sessions_dir: PathBuf,
    backend: StorageBackend,
    event_bus: Arc<EventBus>,
    active: Mutex<HashMap<SessionId, ActiveSession>>,
}

impl AgentRuntime {
    pub fn new(
        definition: Arc<AgentDefinition>,
        provider: Arc<dyn LlmProvider>,
        config: AppConfig,
        event_bus: Arc<EventBus>,
    ) -> Self {
        let sessions_dir = config.sessions_dir();
        let engine = ExecutionEngine::new(
            definition.clone(),
            provider,
            config.model,
            config.engine,
            config.accounts,
            event_bus.clone(),
        );
        Self {
            engine: Arc::new(engine),
            definition,
            sessions_dir,
            backend: config.storage.backend,
            event_bus,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn sessions_dir(&self) -> &std::path::Path {
        &self.sessions_dir
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    fn layout(&self, session_id: &SessionId) -> SessionLayout {
        SessionLayout::new(&self.sessions_dir, session_id)
    }

    async fn store(&self, layout: &SessionLayout) -> Result<Arc<dyn ConversationStore>> {
        open_store(self.backend, &layout.conversations_dir()).await
    }

    /// Create a session at `entry_point` and start running it.
    pub async fn start(
        &self,
        entry_point: &str,
        input: serde_json::Map<String, serde_json::Value>,
        message: Option<String>,
    ) -> Result<SessionId> {
        // Resolve before anything is written.
        self.definition.graph.entry_node(entry_point)?;

        let session_id = SessionId::new();
        let layout = self.layout(&session_id);
        let store = self.store(&layout).await?;
        let session = Session::create(
            session_id.clone(),
            layout,
            store,
            &self.definition.graph,
            entry_point,
            input,
            message,
        )
        .await?;

        info!(
            session_id = %session_id,
            graph_id = %self.definition.graph.id,
            entry_point,
            "Session started"
        );
        self.event_bus.publish(AgentEvent::SessionStarted {
            session_id: session_id.clone(),
            entry_point: entry_point.to_string(),
        });
        self.event_bus.publish(AgentEvent::NodeEntered {
            session_id: session_id.clone(),
            node_id: session.meta.node.id.clone(),
            visit: 1,
        });

        let active = self.spawn(session);
        self.active.lock().await.insert(session_id.clone(), active);
        Ok(session_id)
    }

    /// Start a session from an external trigger (scheduler, webhook) with
    /// input only.
    pub async fn trigger(
        &self,
        entry_point: &str,
        input: serde_json::Map<String, serde_json::Value>,
    ) -> Result<SessionId> {
        debug!(entry_point, "External trigger");
        self.start(entry_point, input, None).await
    }

    /// Continue a suspended session, optionally with the user's reply.
    ///
    /// Works for sessions created by another runtime or process: the state
    /// is loaded from the store.
    pub async fn resume(&self, session_id: &SessionId, user_input: Option<String>) -> Result<()> {
        let mut active = self.active.lock().await;
        if let Some(entry) = active.get(session_id) {
            if entry.is_running() {
                return Err(WaypointError::SessionBusy(session_id.to_string()));
            }
            active.remove(session_id);
        }

        let layout = self.layout(session_id);
        if !layout.exists() {
            return Err(WaypointError::SessionNotFound(session_id.to_string()));
        }
        let store = self.store(&layout).await?;
        let mut session = Session::load(session_id.clone(), layout, store).await?;
        session.submit_user_input(user_input).await?;

        info!(session_id = %session_id, "Session resumed");
        active.insert(session_id.clone(), self.spawn(session));
        Ok(())
    }

    fn spawn(&self, mut session: Session) -> ActiveSession {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let engine = self.engine.clone();
        let handle = tokio::spawn(async move {
            let result = engine.run(&mut session, &token).await;
            if let Err(e) = session.store.close().await {
                warn!(session_id = %session.id, error = %e, "Failed to close store");
            }
            result
        });
        ActiveSession {
            cancel,
            handle: Some(handle),
        }
    }

    /// Wait for the session's task to stop and return where it stopped.
    /// Without an active task the persisted state is returned.
    pub async fn wait(&self, session_id: &SessionId) -> Result<SessionState> {
        let handle = {
            let mut active = self.active.lock().await;
            active.get_mut(session_id).and_then(|entry| entry.handle.take())
        };

        let Some(handle) = handle else {
            return self.status(session_id).await;
        };

        let outcome = handle.await;
        self.active.lock().await.remove(session_id);
        match outcome {
            Ok(result) => result,
            Err(join_err) => Err(WaypointError::InvalidState(format!(
                "session task for {} failed: {}",
                session_id, join_err
            ))),
        }
    }

    /// Persisted state of a session.
    pub async fn status(&self, session_id: &SessionId) -> Result<SessionState> {
        let layout = self.layout(session_id);
        if !layout.exists() {
            return Err(WaypointError::SessionNotFound(session_id.to_string()));
        }
        let store = self.store(&layout).await?;
        let cursor = store.read_cursor().await?;
        store.close().await?;
        cursor
            .map(|c| c.state)
            .ok_or_else(|| WaypointError::SessionNotFound(session_id.to_string()))
    }

    pub async fn is_active(&self, session_id: &SessionId) -> bool {
        self.active
            .lock()
            .await
            .get(session_id)
            .is_some_and(ActiveSession::is_running)
    }

    /// Signal the session's task to stop. Returns whether a task was running.
    pub async fn cancel(&self, session_id: &SessionId) -> bool {
        match self.active.lock().await.get(session_id) {
            Some(entry) => {
                info!(session_id = %session_id, "Cancelling session");
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Stop the session if it is running and delete everything it persisted.
    /// Destroying an unknown session succeeds.
    pub async fn destroy(&self, session_id: &SessionId) -> Result<()> {
        let entry = self.active.lock().await.remove(session_id);
        if let Some(mut entry) = entry {
            entry.cancel.cancel();
            if let Some(handle) = entry.handle.take() {
                let _ = handle.await;
            }
        }

        let layout = self.layout(session_id);
        if layout.exists() {
            let store = self.store(&layout).await?;
            store.destroy().await?;
        }
        layout.remove_all()?;
        info!(session_id = %session_id, "Session destroyed");
        Ok(())
    }

    /// Ids of all persisted sessions.
    pub fn list_sessions(&self) -> Result<Vec<SessionId>> {
        list_session_ids(&self.sessions_dir)
    }
}
