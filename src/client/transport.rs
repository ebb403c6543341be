//! Thin handle over one server-push connection.
//!
//! A reader task (or a test) pushes decoded events into a bounded channel;
//! the owner pulls them with [`Transport::next`]. Closing or dropping the
//! handle aborts the reader so no socket outlives its owner.

use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::error::ClientError;
use super::sse::{SseFrame, SseStreamParser};
use crate::core::{Cursor, StreamEvent};

const CHANNEL_CAPACITY: usize = 256;

pub type TransportSender<T> = mpsc::Sender<Result<T, ClientError>>;

pub struct Transport<T> {
    events: mpsc::Receiver<Result<T, ClientError>>,
    reader: Option<JoinHandle<()>>,
    closed: bool,
}

impl<T: Send + 'static> Transport<T> {
    /// In-memory transport; the returned sender plays the server.
    pub fn channel() -> (TransportSender<T>, Self) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        (
            tx,
            Self {
                events: rx,
                reader: None,
                closed: false,
            },
        )
    }

    /// Spawn a reader that decodes an SSE byte stream into `T` events.
    pub fn spawn_sse<S, B, E, F>(label: String, bytes: S, decode: F) -> Self
    where
        S: Stream<Item = Result<B, E>> + Send + Unpin + 'static,
        B: AsRef<[u8]> + Send + 'static,
        E: Into<ClientError> + Send + 'static,
        F: Fn(&SseFrame) -> Option<T> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let reader = tokio::spawn(read_sse(label, bytes, decode, tx));
        Self {
            events: rx,
            reader: Some(reader),
            closed: false,
        }
    }

    /// Next event, or `None` once the connection has ended or been closed.
    pub async fn next(&mut self) -> Option<Result<T, ClientError>> {
        if self.closed {
            return None;
        }
        self.events.recv().await
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.events.close();
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl<T> Drop for Transport<T> {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

async fn read_sse<T, S, B, E, F>(label: String, mut bytes: S, decode: F, tx: TransportSender<T>)
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Into<ClientError>,
    F: Fn(&SseFrame) -> Option<T>,
{
    let mut parser = SseStreamParser::default();

    while let Some(chunk) = bytes.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                let error = e.into();
                tracing::warn!("SSE stream {} failed: {}", label, error);
                let _ = tx.send(Err(error)).await;
                return;
            }
        };
        for frame in parser.feed(chunk.as_ref()) {
            match decode(&frame) {
                Some(event) => {
                    if tx.send(Ok(event)).await.is_err() {
                        // Owner went away.
                        return;
                    }
                }
                None => tracing::trace!("SSE stream {} skipping '{}' frame", label, frame.event),
            }
        }
    }

    tracing::debug!("SSE stream {} ended", label);
}

/// Position of an applied event within the response it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sequence {
    Chunk(usize),
    Step(usize),
    Terminal,
}

/// One session's response stream. Stamps every event with its absolute
/// index, counting from the cursor the stream was opened at.
pub struct SessionStream {
    session_id: String,
    origin: Cursor,
    next: Cursor,
    transport: Transport<StreamEvent>,
}

impl SessionStream {
    pub fn new(session_id: impl Into<String>, origin: Cursor, transport: Transport<StreamEvent>) -> Self {
        Self {
            session_id: session_id.into(),
            origin,
            next: origin,
            transport,
        }
    }

    /// In-memory session stream for tests and local backends.
    pub fn channel(session_id: impl Into<String>, origin: Cursor) -> (TransportSender<StreamEvent>, Self) {
        let (tx, transport) = Transport::channel();
        (tx, Self::new(session_id, origin, transport))
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn origin(&self) -> Cursor {
        self.origin
    }

    pub async fn next(&mut self) -> Option<Result<(Sequence, StreamEvent), ClientError>> {
        let item = self.transport.next().await?;
        Some(item.map(|event| {
            let sequence = match &event {
                StreamEvent::Delta { .. } => {
                    let index = self.next.chunks_delivered;
                    self.next.chunks_delivered += 1;
                    Sequence::Chunk(index)
                }
                StreamEvent::Step(_) => {
                    let index = self.next.steps_delivered;
                    self.next.steps_delivered += 1;
                    Sequence::Step(index)
                }
                StreamEvent::Done(_) | StreamEvent::Error { .. } => Sequence::Terminal,
            };
            (sequence, event)
        }))
    }

    pub fn close(&mut self) {
        self.transport.close();
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Step;

    #[tokio::test]
    async fn stamps_indices_from_origin() {
        let (tx, mut stream) = SessionStream::channel("s1", Cursor::new(5, 2));
        tx.send(Ok(StreamEvent::Delta { content: "a".into() })).await.unwrap();
        tx.send(Ok(StreamEvent::Step(Step::new("t")))).await.unwrap();
        tx.send(Ok(StreamEvent::Delta { content: "b".into() })).await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(stream.next().await.unwrap().unwrap().0);
        }
        assert_eq!(
            seen,
            vec![Sequence::Chunk(5), Sequence::Step(2), Sequence::Chunk(6)]
        );
    }

    #[tokio::test]
    async fn close_releases_the_server_side() {
        let (tx, mut stream) = SessionStream::channel("s1", Cursor::START);
        stream.close();
        assert!(stream.is_closed());
        assert!(tx.is_closed());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn spawn_sse_decodes_frames_and_reports_errors() {
        let chunks: Vec<Result<Vec<u8>, ClientError>> = vec![
            Ok(b"event: delta\ndata: {\"content\":\"x\"}\n\nevent: usage_info\ndata: {}\n\n".to_vec()),
            Err(ClientError::Network("reset".to_string())),
        ];
        let mut transport = Transport::spawn_sse(
            "test".to_string(),
            futures_util::stream::iter(chunks),
            |frame| StreamEvent::from_frame(&frame.event, &frame.data),
        );

        assert_eq!(
            transport.next().await.unwrap().unwrap(),
            StreamEvent::Delta { content: "x".into() }
        );
        assert!(matches!(
            transport.next().await,
            Some(Err(ClientError::Network(_)))
        ));
        assert!(transport.next().await.is_none());
    }
}
