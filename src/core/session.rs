use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    #[serde(default = "default_session_name")]
    pub session_name: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub cwd: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub trigger: Option<SessionTrigger>,
}

fn default_session_name() -> String {
    "New Session".to_string()
}

impl Session {
    pub fn new(session_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            session_name: default_session_name(),
            model: String::new(),
            cwd: None,
            created_at: now,
            updated_at: now,
            trigger: None,
        }
    }
}

/// Where a session came from when it was not opened by hand in the chat view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionTrigger {
    Manual,
    Automation,
    Schedule,
    /// A trigger this client does not know yet.
    #[serde(other)]
    Unknown,
}

/// `GET /api/sessions/{id}` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionWithMessages {
    #[serde(flatten)]
    pub session: Session,
    #[serde(default)]
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Step {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            detail: None,
        }
    }
}

/// Message identity. A provisional id belongs to a user message inserted
/// locally before the backend has persisted it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageId {
    Server(String),
    Provisional(Uuid),
}

// The backend only ever hands out server ids.
impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(MessageId::Server)
    }
}

impl MessageId {
    pub fn provisional() -> Self {
        MessageId::Provisional(Uuid::new_v4())
    }

    pub fn is_provisional(&self) -> bool {
        matches!(self, MessageId::Provisional(_))
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageId::Server(id) => write!(f, "{}", id),
            MessageId::Provisional(id) => write!(f, "local-{}", id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub steps: Option<Vec<Step>>,
}

impl Message {
    pub fn provisional_user(content: impl Into<String>) -> Self {
        Self {
            id: MessageId::provisional(),
            role: Role::User,
            content: content.into(),
            timestamp: Utc::now(),
            steps: None,
        }
    }
}

/// `GET /api/sessions/{id}/response-status` payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ResponseStatus {
    pub active: bool,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, rename = "chunks_count")]
    pub chunks_delivered: usize,
    #[serde(default, rename = "steps_count")]
    pub steps_delivered: usize,
    #[serde(default)]
    pub error: Option<String>,
}

impl ResponseStatus {
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn active(chunks_delivered: usize, steps_delivered: usize) -> Self {
        Self {
            active: true,
            status: Some("running".to_string()),
            chunks_delivered,
            steps_delivered,
            error: None,
        }
    }
}

/// One entry of the active-agents feed.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ActiveAgent {
    pub session_id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, rename = "chunks_count")]
    pub chunks_delivered: usize,
    #[serde(default, rename = "steps_count")]
    pub steps_delivered: usize,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub content_tail: Option<String>,
    #[serde(default)]
    pub current_step: Option<Step>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ActiveAgents {
    #[serde(default)]
    pub count: usize,
    #[serde(default)]
    pub sessions: Vec<ActiveAgent>,
}
