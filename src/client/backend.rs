use async_trait::async_trait;

use super::error::ClientError;
use super::transport::{SessionStream, Transport};
use crate::core::{ActiveAgents, ActiveAgentsEvent, Cursor, Message, ResponseStatus, Session};

/// Everything the session coordinator needs from the agent backend.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    async fn probe_status(&self, session_id: &str) -> Result<ResponseStatus, ClientError>;

    /// Idempotent; safe to call when the context is already live.
    async fn establish_context(&self, session_id: &str) -> Result<(), ClientError>;

    /// Start a new response. The stream returned starts at [`Cursor::START`].
    async fn send_new_message(&self, session_id: &str, content: &str) -> Result<SessionStream, ClientError>;

    /// Append input to the response that is currently running.
    async fn enqueue_message(&self, session_id: &str, content: &str) -> Result<(), ClientError>;

    async fn open_event_stream(&self, session_id: &str, from: Cursor) -> Result<SessionStream, ClientError>;

    /// Change the session's working directory. The backend tears down the
    /// execution context, so the session is no longer ready afterwards.
    async fn update_context(&self, session_id: &str, cwd: &str) -> Result<Session, ClientError>;

    async fn abort(&self, session_id: &str) -> Result<(), ClientError>;

    async fn fetch_messages(&self, session_id: &str) -> Result<Vec<Message>, ClientError>;

    /// Tell the backend the user has seen the session. Best effort.
    async fn mark_viewed(&self, _session_id: &str) -> Result<(), ClientError> {
        Ok(())
    }
}

/// Cross-session feed of which agents are running right now.
#[async_trait]
pub trait ActiveAgentsFeed: Send + Sync {
    async fn fetch_active_agents(&self) -> Result<ActiveAgents, ClientError>;

    async fn open_active_agents_stream(&self) -> Result<Transport<ActiveAgentsEvent>, ClientError>;
}
