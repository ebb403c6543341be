use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("unauthorized ({0}): the stored token was rejected")]
    Unauthorized(StatusCode),
    #[error("server unreachable: {0}")]
    Network(String),
    #[error("request failed: {status} - {body}")]
    Status { status: StatusCode, body: String },
    #[error("failed to decode response: {0}")]
    Decode(String),
    #[error("stream for session {0} closed before a terminal event")]
    StreamClosed(String),
    #[error("request for session {0} was aborted")]
    Aborted(String),
    #[error("coordinator for session {0} has shut down")]
    Shutdown(String),
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl ClientError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ClientError::Unauthorized(status) | ClientError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// 409/410 from `/enqueue`: the agent the input was meant for is gone.
    pub fn is_no_active_agent(&self) -> bool {
        matches!(
            self.status(),
            Some(StatusCode::CONFLICT) | Some(StatusCode::GONE)
        )
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            ClientError::Decode(error.to_string())
        } else if let Some(status) = error.status() {
            ClientError::Status {
                status,
                body: error.to_string(),
            }
        } else {
            ClientError::Network(error.to_string())
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(error: serde_json::Error) -> Self {
        ClientError::Decode(error.to_string())
    }
}
