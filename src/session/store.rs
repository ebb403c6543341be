//! Chat/view state shared by every view of every session.
//!
//! Holds the authoritative message list, the transient streaming buffer,
//! input lock and unread/active bookkeeping. Every observable mutation is
//! published as a [`StoreEvent`] so list and chat views stay in step.

use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;

use crate::core::{ActiveAgents, Message, MessageId, Session, Step};

const EVENT_CAPACITY: usize = 1024;

pub const ACTIVATING_PLACEHOLDER: &str = "Activating session...";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum InputState {
    #[default]
    Enabled,
    /// The execution context is being (re)established.
    Activating { placeholder: String },
}

impl InputState {
    pub fn is_enabled(&self) -> bool {
        matches!(self, InputState::Enabled)
    }
}

/// Content of a response that is still in flight.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamingBuffer {
    pub content: String,
    pub steps: Vec<Step>,
    pub is_streaming: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SessionView {
    pub session: Option<Session>,
    pub messages: Vec<Message>,
    pub streaming: Option<StreamingBuffer>,
    pub input: InputState,
    pub agent_active: bool,
    pub updated_at: Option<DateTime<Utc>>,
    pub viewed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl SessionView {
    pub fn is_streaming(&self) -> bool {
        self.streaming.as_ref().is_some_and(|buffer| buffer.is_streaming)
    }

    pub fn is_unread(&self) -> bool {
        match (self.updated_at, self.viewed_at) {
            (Some(updated), Some(viewed)) => updated > viewed,
            (Some(_), None) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    InputChanged { session_id: String, input: InputState },
    StreamingChanged { session_id: String, is_streaming: bool },
    ContentAppended { session_id: String, content: String },
    StepAppended { session_id: String, step: Step },
    MessagesReplaced { session_id: String, count: usize },
    ResponseFailed { session_id: String, message: String },
    SessionRenamed { session_id: String, name: String },
    AgentActivityChanged { session_id: String, active: bool },
    UnreadChanged { session_id: String, unread: bool },
}

impl StoreEvent {
    pub fn session_id(&self) -> &str {
        match self {
            StoreEvent::InputChanged { session_id, .. }
            | StoreEvent::StreamingChanged { session_id, .. }
            | StoreEvent::ContentAppended { session_id, .. }
            | StoreEvent::StepAppended { session_id, .. }
            | StoreEvent::MessagesReplaced { session_id, .. }
            | StoreEvent::ResponseFailed { session_id, .. }
            | StoreEvent::SessionRenamed { session_id, .. }
            | StoreEvent::AgentActivityChanged { session_id, .. }
            | StoreEvent::UnreadChanged { session_id, .. } => session_id,
        }
    }
}

#[derive(Debug, Default)]
struct StoreState {
    sessions: HashMap<String, SessionView>,
    viewing: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ChatStore {
    state: Arc<Mutex<StoreState>>,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for ChatStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(StoreState::default())),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, events: Vec<StoreEvent>) {
        for event in events {
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
    }

    /// Mutate one session's view; events are published after the lock is released.
    fn update<R>(&self, session_id: &str, f: impl FnOnce(&mut SessionView, &mut Vec<StoreEvent>) -> R) -> R {
        let mut events = Vec::new();
        let result = {
            let mut state = self.lock();
            let view = state.sessions.entry(session_id.to_string()).or_default();
            f(view, &mut events)
        };
        self.publish(events);
        result
    }

    pub fn snapshot(&self, session_id: &str) -> SessionView {
        self.lock()
            .sessions
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn input_state(&self, session_id: &str) -> InputState {
        self.lock()
            .sessions
            .get(session_id)
            .map(|view| view.input.clone())
            .unwrap_or_default()
    }

    pub fn upsert_session(&self, session: Session) {
        let session_id = session.session_id.clone();
        self.update(&session_id, |view, _| {
            view.updated_at = Some(
                view.updated_at
                    .map_or(session.updated_at, |current| current.max(session.updated_at)),
            );
            view.session = Some(session);
        });
    }

    pub fn rename_session(&self, session_id: &str, name: &str) {
        self.update(session_id, |view, events| {
            if let Some(session) = view.session.as_mut() {
                if session.session_name == name {
                    return;
                }
                session.session_name = name.to_string();
            }
            events.push(StoreEvent::SessionRenamed {
                session_id: session_id.to_string(),
                name: name.to_string(),
            });
        });
    }

    pub fn lock_input(&self, session_id: &str) {
        self.set_input(
            session_id,
            InputState::Activating {
                placeholder: ACTIVATING_PLACEHOLDER.to_string(),
            },
        );
    }

    pub fn unlock_input(&self, session_id: &str) {
        self.set_input(session_id, InputState::Enabled);
    }

    fn set_input(&self, session_id: &str, input: InputState) {
        self.update(session_id, |view, events| {
            if view.input == input {
                return;
            }
            view.input = input.clone();
            events.push(StoreEvent::InputChanged {
                session_id: session_id.to_string(),
                input,
            });
        });
    }

    /// Optimistically show the user's message before the backend confirms it.
    pub fn push_provisional(&self, session_id: &str, content: &str) -> MessageId {
        self.update(session_id, |view, _| {
            let message = Message::provisional_user(content);
            let id = message.id.clone();
            view.messages.push(message);
            id
        })
    }

    /// A new response begins: fresh, empty buffer.
    pub fn begin_streaming(&self, session_id: &str) {
        self.update(session_id, |view, events| {
            view.last_error = None;
            view.streaming = Some(StreamingBuffer {
                is_streaming: true,
                ..StreamingBuffer::default()
            });
            events.push(StoreEvent::StreamingChanged {
                session_id: session_id.to_string(),
                is_streaming: true,
            });
        });
    }

    /// Reattach to a response already in flight. Whatever is buffered stays.
    pub fn resume_streaming(&self, session_id: &str) {
        self.update(session_id, |view, events| {
            let buffer = view.streaming.get_or_insert_with(StreamingBuffer::default);
            if buffer.is_streaming {
                return;
            }
            buffer.is_streaming = true;
            events.push(StoreEvent::StreamingChanged {
                session_id: session_id.to_string(),
                is_streaming: true,
            });
        });
    }

    pub fn append_content(&self, session_id: &str, content: &str) {
        self.update(session_id, |view, events| {
            let buffer = view.streaming.get_or_insert_with(StreamingBuffer::default);
            buffer.content.push_str(content);
            events.push(StoreEvent::ContentAppended {
                session_id: session_id.to_string(),
                content: content.to_string(),
            });
        });
    }

    pub fn append_step(&self, session_id: &str, step: Step) {
        self.update(session_id, |view, events| {
            let buffer = view.streaming.get_or_insert_with(StreamingBuffer::default);
            buffer.steps.push(step.clone());
            events.push(StoreEvent::StepAppended {
                session_id: session_id.to_string(),
                step,
            });
        });
    }

    /// Clear `is_streaming`; the buffer itself stays visible until reconciliation.
    pub fn stop_streaming(&self, session_id: &str) {
        self.update(session_id, |view, events| {
            let Some(buffer) = view.streaming.as_mut() else {
                return;
            };
            if !buffer.is_streaming {
                return;
            }
            buffer.is_streaming = false;
            events.push(StoreEvent::StreamingChanged {
                session_id: session_id.to_string(),
                is_streaming: false,
            });
        });
    }

    /// Reconciliation: the authoritative list replaces everything local,
    /// provisional messages and streaming buffer included.
    pub fn replace_messages(&self, session_id: &str, messages: Vec<Message>) {
        self.update(session_id, |view, events| {
            let count = messages.len();
            view.messages = messages;
            view.streaming = None;
            events.push(StoreEvent::MessagesReplaced {
                session_id: session_id.to_string(),
                count,
            });
        });
    }

    pub fn record_error(&self, session_id: &str, message: &str) {
        self.update(session_id, |view, events| {
            view.last_error = Some(message.to_string());
            events.push(StoreEvent::ResponseFailed {
                session_id: session_id.to_string(),
                message: message.to_string(),
            });
        });
    }

    pub fn set_agent_active(&self, session_id: &str, active: bool) {
        self.update(session_id, |view, events| {
            if view.agent_active == active {
                return;
            }
            view.agent_active = active;
            events.push(StoreEvent::AgentActivityChanged {
                session_id: session_id.to_string(),
                active,
            });
        });
    }

    /// Apply one snapshot of the active-agents feed.
    pub fn sync_active_agents(&self, agents: &ActiveAgents) {
        let stale: Vec<String> = {
            let state = self.lock();
            state
                .sessions
                .iter()
                .filter(|(id, view)| {
                    view.agent_active && !agents.sessions.iter().any(|agent| &agent.session_id == *id)
                })
                .map(|(id, _)| id.clone())
                .collect()
        };
        for session_id in stale {
            self.set_agent_active(&session_id, false);
        }
        for agent in &agents.sessions {
            self.set_agent_active(&agent.session_id, true);
        }
    }

    pub fn is_viewing(&self, session_id: &str) -> bool {
        self.lock().viewing.as_deref() == Some(session_id)
    }

    /// Switch the session the user is looking at; it counts as viewed now.
    pub fn set_viewing(&self, session_id: Option<&str>) {
        self.lock().viewing = session_id.map(str::to_string);
        if let Some(session_id) = session_id {
            let now = Utc::now();
            let seen = self
                .snapshot(session_id)
                .updated_at
                .map_or(now, |updated| updated.max(now));
            self.mark_viewed(session_id, seen);
        }
    }

    pub fn mark_viewed(&self, session_id: &str, at: DateTime<Utc>) {
        self.update(session_id, |view, events| {
            let was_unread = view.is_unread();
            view.viewed_at = Some(view.viewed_at.map_or(at, |current| current.max(at)));
            if was_unread != view.is_unread() {
                events.push(StoreEvent::UnreadChanged {
                    session_id: session_id.to_string(),
                    unread: view.is_unread(),
                });
            }
        });
    }

    /// Seed viewed timestamps from the backend (unix seconds).
    pub fn apply_viewed_timestamps(&self, timestamps: &HashMap<String, f64>) {
        for (session_id, seconds) in timestamps {
            let millis = (seconds * 1000.0) as i64;
            if let Some(at) = Utc.timestamp_millis_opt(millis).single() {
                self.mark_viewed(session_id, at);
            }
        }
    }

    /// The session changed on the backend. Returns whether it is now unread,
    /// which is only possible when nobody is looking at it.
    pub fn mark_updated(&self, session_id: &str, at: DateTime<Utc>) -> bool {
        let viewing = self.is_viewing(session_id);
        self.update(session_id, |view, events| {
            let was_unread = view.is_unread();
            view.updated_at = Some(view.updated_at.map_or(at, |current| current.max(at)));
            if let Some(session) = view.session.as_mut() {
                session.updated_at = session.updated_at.max(at);
            }
            if viewing {
                view.viewed_at = view.updated_at;
            }
            let unread = view.is_unread();
            if was_unread != unread {
                events.push(StoreEvent::UnreadChanged {
                    session_id: session_id.to_string(),
                    unread,
                });
            }
            unread
        })
    }

    pub fn unread_sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .lock()
            .sessions
            .iter()
            .filter(|(_, view)| view.is_unread())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}
