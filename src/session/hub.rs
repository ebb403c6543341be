use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::activation::ActivationSet;
use super::coordinator::{AttachOutcome, CoordinatorHandle, SendOutcome, SessionContext};
use super::cursor::CursorStore;
use super::store::ChatStore;
use super::supervisor::{Backoff, ReconnectSupervisor, SupervisorEvent};
use crate::client::{ActiveAgentsFeed, AgentBackend, AgentClient, AuthMonitor, ClientError};
use crate::core::{ActiveAgentsEvent, Config, Session};

/// Entry point for everything session related. Owns one coordinator per
/// session and the supervisor for the active-agents feed.
pub struct SessionHub {
    context: SessionContext,
    feed: Arc<dyn ActiveAgentsFeed>,
    auth: AuthMonitor,
    backoff: Backoff,
    coordinators: Mutex<HashMap<String, CoordinatorHandle>>,
    supervisor: Mutex<Option<ReconnectSupervisor>>,
}

impl SessionHub {
    pub fn new(
        backend: Arc<dyn AgentBackend>,
        feed: Arc<dyn ActiveAgentsFeed>,
        auth: AuthMonitor,
        backoff: Backoff,
    ) -> Self {
        Self {
            context: SessionContext {
                backend,
                activation: ActivationSet::new(),
                cursors: CursorStore::new(),
                store: ChatStore::new(),
            },
            feed,
            auth,
            backoff,
            coordinators: Mutex::new(HashMap::new()),
            supervisor: Mutex::new(None),
        }
    }

    pub fn from_client(client: AgentClient, config: &Config) -> Self {
        let auth = client.auth().clone();
        let client = Arc::new(client);
        Self::new(
            client.clone(),
            client,
            auth,
            Backoff::from_config(&config.reconnect),
        )
    }

    pub fn store(&self) -> &ChatStore {
        &self.context.store
    }

    pub fn activation(&self) -> &ActivationSet {
        &self.context.activation
    }

    pub fn cursors(&self) -> &CursorStore {
        &self.context.cursors
    }

    pub fn auth(&self) -> &AuthMonitor {
        &self.auth
    }

    fn lock_coordinators(&self) -> MutexGuard<'_, HashMap<String, CoordinatorHandle>> {
        self.coordinators
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Coordinator for `session_id`, spawning it on first use.
    pub fn coordinator(&self, session_id: &str) -> CoordinatorHandle {
        let mut coordinators = self.lock_coordinators();
        if let Some(handle) = coordinators.get(session_id) {
            if handle.is_running() {
                return handle.clone();
            }
        }
        tracing::debug!("Spawning coordinator for session {}", session_id);
        let handle = CoordinatorHandle::spawn(session_id, self.context.clone());
        coordinators.insert(session_id.to_string(), handle.clone());
        handle
    }

    pub async fn send(&self, session_id: &str, content: &str) -> Result<SendOutcome, ClientError> {
        self.coordinator(session_id).send(content).await
    }

    pub async fn attach(&self, session_id: &str) -> Result<AttachOutcome, ClientError> {
        self.coordinator(session_id).attach().await
    }

    pub async fn abort(&self, session_id: &str) -> Result<(), ClientError> {
        self.coordinator(session_id).abort().await
    }

    /// Change the working directory. The next send has to establish a fresh
    /// execution context.
    pub async fn change_context(&self, session_id: &str, cwd: &str) -> Result<Session, ClientError> {
        let session = self.context.backend.update_context(session_id, cwd).await?;
        self.context.activation.clear_ready(session_id);
        self.context.store.upsert_session(session.clone());
        tracing::info!("Session {} working directory set to {}", session_id, cwd);
        Ok(session)
    }

    /// Switch the viewed session and tell the backend about it.
    pub async fn set_viewing(&self, session_id: Option<&str>) {
        self.context.store.set_viewing(session_id);
        if let Some(session_id) = session_id {
            if let Err(e) = self.context.backend.mark_viewed(session_id).await {
                tracing::debug!("Failed to mark session {} viewed: {}", session_id, e);
            }
        }
    }

    /// Keep the store's active/unread bookkeeping in sync with the backend's
    /// active-agents feed. No-op while already watching.
    pub fn watch_active_agents(&self) {
        let mut supervisor = self
            .supervisor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if supervisor.as_ref().is_some_and(ReconnectSupervisor::is_running) {
            return;
        }

        let store = self.context.store.clone();
        *supervisor = Some(ReconnectSupervisor::spawn(
            self.feed.clone(),
            self.backoff.clone(),
            self.auth.clone(),
            move |event| apply_feed_event(&store, event),
        ));
    }

    pub async fn stop_watching(&self) {
        let supervisor = self
            .supervisor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(supervisor) = supervisor {
            supervisor.shutdown().await;
        }
    }

    /// Close every owned transport and timer.
    pub async fn shutdown(&self) {
        self.stop_watching().await;
        let coordinators: Vec<CoordinatorHandle> =
            self.lock_coordinators().drain().map(|(_, handle)| handle).collect();
        for handle in coordinators {
            handle.shutdown().await;
        }
        tracing::debug!("Session hub shut down");
    }
}

fn apply_feed_event(store: &ChatStore, event: SupervisorEvent) {
    match event {
        SupervisorEvent::Event(ActiveAgentsEvent::Update(agents)) => store.sync_active_agents(&agents),
        SupervisorEvent::Event(ActiveAgentsEvent::Completed { session_id }) => {
            store.set_agent_active(&session_id, false);
            store.mark_updated(&session_id, Utc::now());
        }
        SupervisorEvent::Connected
        | SupervisorEvent::Disconnected { .. }
        | SupervisorEvent::AwaitingCredentials => {}
    }
}
