use serde::Deserialize;
use serde_json::Value;

use super::session::{ActiveAgents, Step};

/// Resume offset into one in-flight response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Cursor {
    pub chunks_delivered: usize,
    pub steps_delivered: usize,
}

impl Cursor {
    pub const START: Cursor = Cursor {
        chunks_delivered: 0,
        steps_delivered: 0,
    };

    pub fn new(chunks_delivered: usize, steps_delivered: usize) -> Self {
        Self {
            chunks_delivered,
            steps_delivered,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DonePayload {
    #[serde(default)]
    pub content_length: Option<usize>,
    /// Name generated by the backend for sessions the user never named.
    #[serde(default)]
    pub session_name: Option<String>,
}

/// Events carried by a single session's response stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Delta { content: String },
    Step(Step),
    Done(DonePayload),
    Error { message: String },
}

#[derive(Debug, Deserialize)]
struct DeltaPayload {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct ErrorPayload {
    #[serde(default, alias = "message")]
    error: Option<String>,
}

impl StreamEvent {
    /// Map one SSE frame onto a stream event. Unknown event names
    /// (usage_info, pending_messages, ...) yield `None`.
    pub fn from_frame(event: &str, data: &str) -> Option<Self> {
        match event {
            "delta" => {
                let payload: DeltaPayload = serde_json::from_str(data).ok()?;
                Some(StreamEvent::Delta {
                    content: payload.content,
                })
            }
            "step" => serde_json::from_str::<Step>(data).ok().map(StreamEvent::Step),
            "done" => {
                let payload = if data.trim().is_empty() {
                    DonePayload::default()
                } else {
                    serde_json::from_str(data).unwrap_or_default()
                };
                Some(StreamEvent::Done(payload))
            }
            "error" => {
                let message = serde_json::from_str::<ErrorPayload>(data)
                    .ok()
                    .and_then(|payload| payload.error)
                    .unwrap_or_else(|| data.trim().to_string());
                Some(StreamEvent::Error { message })
            }
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done(_) | StreamEvent::Error { .. })
    }
}

/// Events carried by the cross-session active-agents feed.
#[derive(Debug, Clone, PartialEq)]
pub enum ActiveAgentsEvent {
    Update(ActiveAgents),
    Completed { session_id: String },
}

impl ActiveAgentsEvent {
    pub fn from_frame(event: &str, data: &str) -> Option<Self> {
        match event {
            "update" => serde_json::from_str(data).ok().map(ActiveAgentsEvent::Update),
            "completed" | "done" => {
                let value: Value = serde_json::from_str(data).ok()?;
                let session_id = value.get("session_id")?.as_str()?.to_string();
                Some(ActiveAgentsEvent::Completed { session_id })
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_session_stream_frames() {
        assert_eq!(
            StreamEvent::from_frame("delta", r#"{"content":"Hel"}"#),
            Some(StreamEvent::Delta {
                content: "Hel".to_string()
            })
        );
        assert_eq!(
            StreamEvent::from_frame("step", r#"{"title":"Reading files","detail":"src/lib.rs"}"#),
            Some(StreamEvent::Step(Step {
                title: "Reading files".to_string(),
                detail: Some("src/lib.rs".to_string()),
            }))
        );
        assert_eq!(
            StreamEvent::from_frame("done", r#"{"content_length":12,"session_name":"Fix tests"}"#),
            Some(StreamEvent::Done(DonePayload {
                content_length: Some(12),
                session_name: Some("Fix tests".to_string()),
            }))
        );
    }

    #[test]
    fn error_frames_accept_either_field_name() {
        let expected = Some(StreamEvent::Error {
            message: "boom".to_string(),
        });
        assert_eq!(StreamEvent::from_frame("error", r#"{"error":"boom"}"#), expected);
        assert_eq!(StreamEvent::from_frame("error", r#"{"message":"boom"}"#), expected);
    }

    #[test]
    fn ignores_pass_through_notifications() {
        assert_eq!(StreamEvent::from_frame("usage_info", r#"{"tokens":3}"#), None);
        assert_eq!(StreamEvent::from_frame("pending_messages", "{}"), None);
        assert_eq!(StreamEvent::from_frame("step", "{not json"), None);
    }

    #[test]
    fn maps_active_agent_frames() {
        let update = ActiveAgentsEvent::from_frame(
            "update",
            r#"{"count":1,"sessions":[{"session_id":"s1","status":"running","chunks_count":3,"steps_count":1}]}"#,
        )
        .unwrap();
        match update {
            ActiveAgentsEvent::Update(agents) => {
                assert_eq!(agents.count, 1);
                assert_eq!(agents.sessions[0].chunks_delivered, 3);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(
            ActiveAgentsEvent::from_frame("completed", r#"{"session_id":"s1"}"#),
            Some(ActiveAgentsEvent::Completed {
                session_id: "s1".to_string()
            })
        );
    }
}
