use async_trait::async_trait;
use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

use super::auth::AuthMonitor;
use super::backend::{ActiveAgentsFeed, AgentBackend};
use super::error::ClientError;
use super::transport::{SessionStream, Transport};
use crate::core::{
    ActiveAgents, ActiveAgentsEvent, Config, Cursor, Message, ResponseStatus, Session,
    SessionWithMessages, StreamEvent,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client for the agent console backend. Every request goes through
/// [`AgentClient::execute`], which keeps the shared [`AuthMonitor`] current.
#[derive(Debug, Clone)]
pub struct AgentClient {
    base_url: Url,
    client: Client,
    token: Option<String>,
    request_timeout: Duration,
    auth: AuthMonitor,
}

/// `is_new_session` stays false: `establish_context` has already created the
/// backend session by the time a message is sent.
#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    content: &'a str,
    is_new_session: bool,
}

#[derive(Debug, Serialize)]
struct EnqueueRequest<'a> {
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct UpdateSessionRequest<'a> {
    cwd: &'a str,
}

#[derive(Debug, Deserialize)]
struct SessionList {
    #[serde(default)]
    sessions: Vec<Session>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DisconnectOutcome {
    #[serde(default)]
    pub success: bool,
    /// The backend kept the context alive because an agent is still running.
    #[serde(default)]
    pub deferred: bool,
}

impl AgentClient {
    pub fn new(
        base_url: &str,
        token: Option<String>,
        request_timeout: Duration,
        auth: AuthMonitor,
    ) -> Result<Self, ClientError> {
        let base_url = Url::parse(base_url)?;
        if base_url.cannot_be_a_base() {
            return Err(ClientError::InvalidUrl(
                url::ParseError::RelativeUrlWithCannotBeABaseBase,
            ));
        }

        // No overall timeout on the client: response streams stay open for
        // as long as the agent runs. Plain requests set one per call.
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;

        Ok(Self {
            base_url,
            client,
            token,
            request_timeout,
            auth,
        })
    }

    pub fn from_config(config: &Config, auth: AuthMonitor) -> Result<Self, ClientError> {
        Self::new(
            &config.server.base_url,
            config.server.token.clone(),
            Duration::from_millis(config.server.request_timeout_ms),
            auth,
        )
    }

    pub fn auth(&self) -> &AuthMonitor {
        &self.auth
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Swap credentials after the user re-pairs; clears the unauthorized state.
    pub fn set_token(&mut self, token: Option<String>) {
        self.token = token;
        self.auth.credentials_replaced();
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().push("api").extend(segments);
        }
        url
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Shared response handler: sends the request and folds the outcome
    /// into the global auth state.
    async fn execute(&self, builder: RequestBuilder) -> Result<Response, ClientError> {
        let response = match self.authorize(builder).send().await {
            Ok(response) => response,
            Err(e) => {
                let error = ClientError::from(e);
                if matches!(error, ClientError::Network(_)) {
                    self.auth.record_network_failure().await;
                }
                tracing::debug!("Request failed: {}", error);
                return Err(error);
            }
        };

        let status = response.status();
        tracing::debug!("{} {}", status, response.url().path());

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            self.auth.record_unauthorized();
            return Err(ClientError::Unauthorized(status));
        }

        self.auth.record_success();

        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::Status { status, body });
        }

        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, ClientError> {
        let response = self
            .execute(self.client.get(url).timeout(self.request_timeout))
            .await?;
        let text = response.text().await?;
        Ok(serde_json::from_str(&text)?)
    }

    async fn post_json<B: Serialize + ?Sized>(&self, url: Url, body: &B) -> Result<Response, ClientError> {
        self.execute(self.client.post(url).json(body).timeout(self.request_timeout))
            .await
    }

    async fn open_sse(&self, builder: RequestBuilder) -> Result<Response, ClientError> {
        self.execute(builder.header(header::ACCEPT, "text/event-stream"))
            .await
    }

    /// Check if the backend answers at all.
    pub async fn is_server_running(&self) -> bool {
        self.client
            .get(self.endpoint(&["sessions"]))
            .timeout(Duration::from_secs(2))
            .send()
            .await
            .is_ok()
    }

    pub async fn list_sessions(&self) -> Result<Vec<Session>, ClientError> {
        let list: SessionList = self.get_json(self.endpoint(&["sessions"])).await?;
        Ok(list.sessions)
    }

    pub async fn get_session(&self, session_id: &str) -> Result<SessionWithMessages, ClientError> {
        self.get_json(self.endpoint(&["sessions", session_id])).await
    }

    pub async fn disconnect(&self, session_id: &str) -> Result<DisconnectOutcome, ClientError> {
        let response = self
            .post_json(self.endpoint(&["sessions", session_id, "disconnect"]), &serde_json::json!({}))
            .await?;
        let text = response.text().await?;
        Ok(serde_json::from_str(&text).unwrap_or_default())
    }

    /// Unix timestamps (seconds) of when each session was last viewed.
    pub async fn viewed_timestamps(&self) -> Result<HashMap<String, f64>, ClientError> {
        self.get_json(self.endpoint(&["viewed"])).await
    }

    fn session_stream(&self, session_id: &str, origin: Cursor, response: Response) -> SessionStream {
        let transport = Transport::spawn_sse(
            format!("session {}", session_id),
            Box::pin(response.bytes_stream()),
            |frame| StreamEvent::from_frame(&frame.event, &frame.data),
        );
        SessionStream::new(session_id, origin, transport)
    }
}

#[async_trait]
impl AgentBackend for AgentClient {
    async fn probe_status(&self, session_id: &str) -> Result<ResponseStatus, ClientError> {
        self.get_json(self.endpoint(&["sessions", session_id, "response-status"]))
            .await
    }

    async fn establish_context(&self, session_id: &str) -> Result<(), ClientError> {
        self.post_json(self.endpoint(&["sessions", session_id, "connect"]), &serde_json::json!({}))
            .await?;
        Ok(())
    }

    async fn send_new_message(&self, session_id: &str, content: &str) -> Result<SessionStream, ClientError> {
        let request = SendMessageRequest {
            content,
            is_new_session: false,
        };
        let response = self
            .open_sse(
                self.client
                    .post(self.endpoint(&["sessions", session_id, "messages"]))
                    .json(&request),
            )
            .await?;
        Ok(self.session_stream(session_id, Cursor::START, response))
    }

    async fn enqueue_message(&self, session_id: &str, content: &str) -> Result<(), ClientError> {
        self.post_json(
            self.endpoint(&["sessions", session_id, "enqueue"]),
            &EnqueueRequest { content },
        )
        .await?;
        Ok(())
    }

    async fn open_event_stream(&self, session_id: &str, from: Cursor) -> Result<SessionStream, ClientError> {
        let mut url = self.endpoint(&["sessions", session_id, "response-stream"]);
        url.query_pairs_mut()
            .append_pair("from_chunk", &from.chunks_delivered.to_string())
            .append_pair("from_step", &from.steps_delivered.to_string());

        tracing::debug!("Resuming session {} stream from {:?}", session_id, from);
        let response = self.open_sse(self.client.get(url)).await?;
        Ok(self.session_stream(session_id, from, response))
    }

    async fn update_context(&self, session_id: &str, cwd: &str) -> Result<Session, ClientError> {
        let request = UpdateSessionRequest { cwd };
        let response = self
            .execute(
                self.client
                    .patch(self.endpoint(&["sessions", session_id]))
                    .json(&request)
                    .timeout(self.request_timeout),
            )
            .await?;
        let text = response.text().await?;
        Ok(serde_json::from_str(&text)?)
    }

    async fn abort(&self, session_id: &str) -> Result<(), ClientError> {
        self.post_json(self.endpoint(&["sessions", session_id, "abort"]), &serde_json::json!({}))
            .await?;
        Ok(())
    }

    async fn fetch_messages(&self, session_id: &str) -> Result<Vec<Message>, ClientError> {
        Ok(self.get_session(session_id).await?.messages)
    }

    async fn mark_viewed(&self, session_id: &str) -> Result<(), ClientError> {
        self.post_json(self.endpoint(&["viewed", session_id]), &serde_json::json!({}))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ActiveAgentsFeed for AgentClient {
    async fn fetch_active_agents(&self) -> Result<ActiveAgents, ClientError> {
        self.get_json(self.endpoint(&["sessions", "active-agents"])).await
    }

    async fn open_active_agents_stream(&self) -> Result<Transport<ActiveAgentsEvent>, ClientError> {
        let response = self
            .open_sse(self.client.get(self.endpoint(&["sessions", "active-agents", "stream"])))
            .await?;
        Ok(Transport::spawn_sse(
            "active-agents".to_string(),
            Box::pin(response.bytes_stream()),
            |frame| ActiveAgentsEvent::from_frame(&frame.event, &frame.data),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::auth::StaticConnectivity;
    use std::sync::Arc;

    fn client(base: &str) -> AgentClient {
        AgentClient::new(
            base,
            None,
            Duration::from_secs(1),
            AuthMonitor::new(Arc::new(StaticConnectivity(true))),
        )
        .unwrap()
    }

    #[test]
    fn endpoints_escape_ids_and_keep_base_path() {
        let client = client("https://tunnel.example/console/");
        assert_eq!(
            client.endpoint(&["sessions", "a b", "connect"]).as_str(),
            "https://tunnel.example/console/api/sessions/a%20b/connect"
        );

        let client = self::client("http://localhost:8765");
        assert_eq!(
            client.endpoint(&["viewed"]).as_str(),
            "http://localhost:8765/api/viewed"
        );
    }

    #[test]
    fn rejects_non_base_urls() {
        let result = AgentClient::new(
            "mailto:someone@example.com",
            None,
            Duration::from_secs(1),
            AuthMonitor::new(Arc::new(StaticConnectivity(true))),
        );
        assert!(matches!(result, Err(ClientError::InvalidUrl(_))));
    }
}
