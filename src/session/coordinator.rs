//! Per-session stream coordinator.
//!
//! Each session gets one actor task. Commands (send, attach, abort) and
//! stream events are handled one at a time on that task, so the phase and
//! the owned transport never need a lock. Every await inside a command is a
//! suspension point and has its own [`Phase`]; whatever changed meanwhile is
//! re-checked before a stream is attached. An abort interrupts a send or
//! attach that is still waiting on the backend.

use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

use super::activation::ActivationSet;
use super::cursor::{Advance, CursorStore};
use super::store::ChatStore;
use crate::client::{AgentBackend, ClientError, Sequence, SessionStream};
use crate::core::{Cursor, DonePayload, ResponseStatus, StreamEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Probing,
    Resuming,
    Connecting,
    Streaming,
    Finalizing,
    ErrorRecovery,
}

/// How a send was delivered to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// A new response was started on a fresh stream.
    Started,
    /// An agent was already running; the stream was resumed and the input enqueued.
    Resumed { from: Cursor },
    /// The input was appended to the response this coordinator is streaming.
    Enqueued,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    Resumed { from: Cursor },
    Idle,
}

/// Collaborators shared by every coordinator.
#[derive(Clone)]
pub struct SessionContext {
    pub backend: Arc<dyn AgentBackend>,
    pub activation: ActivationSet,
    pub cursors: CursorStore,
    pub store: ChatStore,
}

enum Command {
    Send {
        content: String,
        reply: oneshot::Sender<Result<SendOutcome, ClientError>>,
    },
    Attach {
        reply: oneshot::Sender<Result<AttachOutcome, ClientError>>,
    },
    Abort {
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running coordinator (cheap to Clone).
#[derive(Clone)]
pub struct CoordinatorHandle {
    session_id: String,
    command_tx: mpsc::UnboundedSender<Command>,
    phase: watch::Receiver<Phase>,
    aborts: Arc<watch::Sender<u64>>,
}

impl CoordinatorHandle {
    pub fn spawn(session_id: impl Into<String>, context: SessionContext) -> Self {
        let session_id = session_id.into();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (phase_tx, phase) = watch::channel(Phase::Idle);
        let (aborts, aborts_rx) = watch::channel(0);

        let coordinator = SessionCoordinator {
            session_id: session_id.clone(),
            context,
            stream: None,
            generation: 0,
            awaiting_first_event: None,
            phase: phase_tx,
            command_rx,
            aborts: aborts_rx,
        };
        tokio::spawn(coordinator.run());

        Self {
            session_id,
            command_tx,
            phase,
            aborts: Arc::new(aborts),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub fn watch_phase(&self) -> watch::Receiver<Phase> {
        self.phase.clone()
    }

    /// Wait until the coordinator is idle again (response finished, failed
    /// or aborted).
    pub async fn wait_idle(&self) {
        let mut phase = self.phase.clone();
        let _ = phase.wait_for(|phase| *phase == Phase::Idle).await;
    }

    pub async fn send(&self, content: impl Into<String>) -> Result<SendOutcome, ClientError> {
        let content = content.into();
        self.request(|reply| Command::Send { content, reply }).await?
    }

    /// Reattach after a reload or dropped connection.
    pub async fn attach(&self) -> Result<AttachOutcome, ClientError> {
        self.request(|reply| Command::Attach { reply }).await?
    }

    /// Interrupts a send or attach still in flight, then closes the stream
    /// and tells the backend.
    pub async fn abort(&self) -> Result<(), ClientError> {
        self.aborts.send_modify(|count| *count += 1);
        self.request(|reply| Command::Abort { reply }).await?
    }

    /// Close the owned transport and stop the actor.
    pub async fn shutdown(&self) {
        let _ = self.request(|reply| Command::Shutdown { reply }).await;
    }

    pub fn is_running(&self) -> bool {
        !self.command_tx.is_closed()
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, ClientError> {
        let (reply, response_rx) = oneshot::channel();
        self.command_tx
            .send(command(reply))
            .map_err(|_| ClientError::Shutdown(self.session_id.clone()))?;
        response_rx
            .await
            .map_err(|_| ClientError::Shutdown(self.session_id.clone()))
    }
}

struct SessionCoordinator {
    session_id: String,
    context: SessionContext,
    stream: Option<SessionStream>,
    /// Activation generation read when the current command started.
    generation: u64,
    /// Set from attach until the first delta/step of that stream.
    awaiting_first_event: Option<u64>,
    phase: watch::Sender<Phase>,
    command_rx: mpsc::UnboundedReceiver<Command>,
    aborts: watch::Receiver<u64>,
}

async fn next_item(
    stream: &mut Option<SessionStream>,
) -> Option<Result<(Sequence, StreamEvent), ClientError>> {
    match stream {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

/// Run `work` unless an abort arrives first. The abort command itself is
/// queued behind and does the cleanup.
async fn abortable<T>(
    session_id: &str,
    aborts: &mut watch::Receiver<u64>,
    work: impl Future<Output = Result<T, ClientError>>,
) -> Result<T, ClientError> {
    tokio::select! {
        result = work => result,
        Ok(()) = aborts.changed() => {
            tracing::info!("Session {}: in-flight request interrupted by abort", session_id);
            Err(ClientError::Aborted(session_id.to_string()))
        }
    }
}

impl SessionCoordinator {
    async fn run(mut self) {
        tracing::debug!("Coordinator for session {} started", self.session_id);

        loop {
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(Command::Send { content, reply }) => {
                        let (session_id, mut aborts) = self.abort_signal();
                        let result = abortable(&session_id, &mut aborts, self.send(content)).await;
                        let _ = reply.send(result);
                    }
                    Some(Command::Attach { reply }) => {
                        let (session_id, mut aborts) = self.abort_signal();
                        let result = abortable(&session_id, &mut aborts, self.attach()).await;
                        let _ = reply.send(result);
                    }
                    Some(Command::Abort { reply }) => {
                        let result = self.abort().await;
                        let _ = reply.send(result);
                    }
                    Some(Command::Shutdown { reply }) => {
                        self.teardown();
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        self.teardown();
                        break;
                    }
                },
                item = next_item(&mut self.stream), if self.stream.is_some() => {
                    self.on_stream_item(item).await;
                }
            }
        }

        tracing::debug!("Coordinator for session {} stopped", self.session_id);
    }

    /// Aborts requested from now on.
    fn abort_signal(&self) -> (String, watch::Receiver<u64>) {
        let mut aborts = self.aborts.clone();
        aborts.mark_unchanged();
        (self.session_id.clone(), aborts)
    }

    fn set_phase(&self, phase: Phase) {
        self.phase.send_if_modified(|current| {
            if *current == phase {
                return false;
            }
            tracing::debug!("Session {}: {:?} -> {:?}", self.session_id, current, phase);
            *current = phase;
            true
        });
    }

    fn id(&self) -> &str {
        &self.session_id
    }

    async fn send(&mut self, content: String) -> Result<SendOutcome, ClientError> {
        let store = self.context.store.clone();
        self.generation = self.context.activation.generation(self.id());

        // A response is already attached: never start a second execution.
        if self.stream.is_some() {
            store.push_provisional(self.id(), &content);
            return match self.enqueue(&content).await {
                Ok(()) => Ok(SendOutcome::Enqueued),
                Err(e) => {
                    store.record_error(self.id(), &e.to_string());
                    Err(e)
                }
            };
        }

        let ready = self.context.activation.is_ready(self.id());
        if !ready {
            store.lock_input(self.id());
        }
        store.push_provisional(self.id(), &content);

        self.set_phase(Phase::Probing);
        let status = match self.context.backend.probe_status(self.id()).await {
            Ok(status) => status,
            Err(e) => return Err(self.fail_before_attach(e)),
        };

        if status.active {
            if let Some(from) = self.resume_and_enqueue(&status, &content).await? {
                return Ok(SendOutcome::Resumed { from });
            }
            return self.start_response(&content).await;
        }

        self.connect(&content, ready).await
    }

    async fn enqueue(&mut self, content: &str) -> Result<(), ClientError> {
        tracing::info!("Session {}: enqueueing input to running agent", self.session_id);
        self.context
            .backend
            .enqueue_message(self.id(), content)
            .await
            .inspect_err(|e| tracing::warn!("Session {}: enqueue failed: {}", self.session_id, e))
    }

    /// Resume the running response and hand it the new input. `None` means
    /// the agent finished in between and a fresh response is needed.
    async fn resume_and_enqueue(
        &mut self,
        status: &ResponseStatus,
        content: &str,
    ) -> Result<Option<Cursor>, ClientError> {
        let from = self.resume(status).await?;
        match self.enqueue(content).await {
            Ok(()) => Ok(Some(from)),
            Err(e) if e.is_no_active_agent() => {
                tracing::info!(
                    "Session {}: agent finished before input was enqueued, starting a new response",
                    self.session_id
                );
                self.detach_stream();
                self.context.store.stop_streaming(self.id());
                self.context.cursors.remove(self.id());
                Ok(None)
            }
            Err(e) => {
                self.context.store.record_error(self.id(), &e.to_string());
                Err(e)
            }
        }
    }

    /// Probing found no active response: establish the context if needed,
    /// then start a new response on a fresh stream.
    async fn connect(&mut self, content: &str, ready: bool) -> Result<SendOutcome, ClientError> {
        self.set_phase(Phase::Connecting);

        if !ready {
            if let Err(e) = self.context.backend.establish_context(self.id()).await {
                return Err(self.fail_before_attach(e));
            }

            // Re-validate after the round trip; another client may have
            // started a response for this session in the meantime.
            match self.context.backend.probe_status(self.id()).await {
                Ok(status) if status.active => {
                    if let Some(from) = self.resume_and_enqueue(&status, content).await? {
                        return Ok(SendOutcome::Resumed { from });
                    }
                }
                Ok(_) => {}
                Err(e) => return Err(self.fail_before_attach(e)),
            }
        }

        self.start_response(content).await
    }

    async fn start_response(&mut self, content: &str) -> Result<SendOutcome, ClientError> {
        self.set_phase(Phase::Connecting);
        self.context.cursors.reset(self.id());
        let stream = match self.context.backend.send_new_message(self.id(), content).await {
            Ok(stream) => stream,
            Err(e) => {
                self.set_phase(Phase::ErrorRecovery);
                self.context.cursors.remove(self.id());
                self.context.store.record_error(self.id(), &e.to_string());
                self.reconcile().await;
                self.context.store.unlock_input(self.id());
                self.set_phase(Phase::Idle);
                return Err(e);
            }
        };

        self.attach_stream(stream);
        self.context.store.begin_streaming(self.id());
        tracing::info!("Session {}: started new response", self.session_id);
        Ok(SendOutcome::Started)
    }

    /// Reattach to a running response from the freshest known offset.
    async fn resume(&mut self, status: &ResponseStatus) -> Result<Cursor, ClientError> {
        self.set_phase(Phase::Resuming);
        let from = self.resume_cursor(status);

        let stream = match self.context.backend.open_event_stream(self.id(), from).await {
            Ok(stream) => stream,
            Err(e) => {
                self.recover(&e.to_string()).await;
                return Err(e);
            }
        };
        self.attach_stream(stream);
        self.context.store.resume_streaming(self.id());
        tracing::info!("Session {}: resumed response from {:?}", self.session_id, from);
        Ok(from)
    }

    /// Local cursor when it describes the same response, else the counts the
    /// backend reported.
    fn resume_cursor(&self, status: &ResponseStatus) -> Cursor {
        let reported = Cursor::new(status.chunks_delivered, status.steps_delivered);
        match self.context.cursors.get(self.id()) {
            Some(local)
                if local.chunks_delivered <= reported.chunks_delivered
                    && local.steps_delivered <= reported.steps_delivered =>
            {
                local
            }
            _ => {
                self.context.cursors.reset(self.id());
                self.context.cursors.seed(self.id(), reported)
            }
        }
    }

    /// At most one live transport per session: the old one goes first.
    fn attach_stream(&mut self, stream: SessionStream) {
        if let Some(mut previous) = self.stream.take() {
            tracing::info!(
                "Session {}: closing previous stream opened at {:?}",
                self.session_id,
                previous.origin()
            );
            previous.close();
        }
        tracing::debug!(
            "Session {}: attached stream at {:?}",
            stream.session_id(),
            stream.origin()
        );
        self.awaiting_first_event = Some(self.generation);
        self.stream = Some(stream);
    }

    fn detach_stream(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.close();
        }
    }

    /// Probe/establish failed. Liveness is unconfirmed so the input lock
    /// (if any) stays in place.
    fn fail_before_attach(&mut self, error: ClientError) -> ClientError {
        tracing::warn!("Session {}: activation failed: {}", self.session_id, error);
        self.context.store.record_error(self.id(), &error.to_string());
        self.set_phase(Phase::Idle);
        error
    }

    async fn attach(&mut self) -> Result<AttachOutcome, ClientError> {
        self.generation = self.context.activation.generation(self.id());
        let previous = *self.phase.borrow();
        self.set_phase(Phase::Probing);
        let status = match self.context.backend.probe_status(self.id()).await {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!("Session {}: status probe failed: {}", self.session_id, e);
                self.set_phase(if self.stream.is_some() { previous } else { Phase::Idle });
                return Err(e);
            }
        };

        if status.active {
            let from = self.resume(&status).await?;
            return Ok(AttachOutcome::Resumed { from });
        }

        if self.stream.is_some() {
            // Backend says the response is over; ours just never saw the end.
            self.detach_stream();
            self.context.store.stop_streaming(self.id());
            self.context.cursors.remove(self.id());
            self.reconcile().await;
        }
        self.set_phase(Phase::Idle);
        Ok(AttachOutcome::Idle)
    }

    async fn abort(&mut self) -> Result<(), ClientError> {
        tracing::info!("Session {}: abort requested", self.session_id);
        self.detach_stream();
        self.context.store.stop_streaming(self.id());
        self.context.cursors.remove(self.id());
        self.reconcile().await;
        // An interrupted send may have locked the input without attaching.
        self.awaiting_first_event = None;
        self.context.store.unlock_input(self.id());
        self.set_phase(Phase::Idle);
        self.context.backend.abort(self.id()).await
    }

    async fn on_stream_item(&mut self, item: Option<Result<(Sequence, StreamEvent), ClientError>>) {
        match item {
            None => {
                let error = ClientError::StreamClosed(self.session_id.clone());
                tracing::warn!("{}", error);
                self.recover(&error.to_string()).await;
            }
            Some(Err(e)) => {
                tracing::warn!("Session {}: stream error: {}", self.session_id, e);
                self.recover(&e.to_string()).await;
            }
            Some(Ok((sequence, event))) => match event {
                StreamEvent::Delta { content } => {
                    if self.advance(sequence) {
                        self.context.store.append_content(self.id(), &content);
                    }
                }
                StreamEvent::Step(step) => {
                    if self.advance(sequence) {
                        self.context.store.append_step(self.id(), step);
                    }
                }
                StreamEvent::Done(payload) => self.finalize(payload).await,
                StreamEvent::Error { message } => {
                    tracing::warn!("Session {}: agent reported error: {}", self.session_id, message);
                    self.recover(&message).await;
                }
            },
        }
    }

    /// Apply the cursor; returns whether the event is new.
    fn advance(&mut self, sequence: Sequence) -> bool {
        match self.context.cursors.advance(self.id(), sequence) {
            Advance::Applied => {
                self.on_live_event();
                self.set_phase(Phase::Streaming);
                true
            }
            Advance::Duplicate => {
                tracing::debug!("Session {}: dropping replayed {:?}", self.session_id, sequence);
                false
            }
            Advance::Gap { expected, got } => {
                tracing::warn!(
                    "Session {}: stream skipped ahead (expected {}, got {}), leaving it to reconciliation",
                    self.session_id,
                    expected,
                    got
                );
                false
            }
        }
    }

    /// First event of a stream proves the context is alive, unless the
    /// context changed after the stream was requested.
    fn on_live_event(&mut self) {
        let Some(generation) = self.awaiting_first_event.take() else {
            return;
        };
        if self.context.activation.mark_ready_since(self.id(), generation) {
            tracing::info!("Session {} is ready", self.session_id);
        }
        self.context.store.unlock_input(self.id());
    }

    async fn finalize(&mut self, payload: DonePayload) {
        self.set_phase(Phase::Finalizing);
        self.detach_stream();
        self.on_live_event();
        self.context.store.stop_streaming(self.id());
        self.context.cursors.remove(self.id());

        if let Some(name) = payload.session_name.as_deref() {
            self.context.store.rename_session(self.id(), name);
        }

        self.reconcile().await;

        let unread = self.context.store.mark_updated(self.id(), Utc::now());
        if !unread && self.context.store.is_viewing(self.id()) {
            if let Err(e) = self.context.backend.mark_viewed(self.id()).await {
                tracing::debug!("Session {}: mark viewed failed: {}", self.session_id, e);
            }
        }

        tracing::info!("Session {}: response complete", self.session_id);
        self.set_phase(Phase::Idle);
    }

    /// Transport dropped or the agent failed. A user-initiated response is
    /// never retried here; the server's view of it is fetched instead.
    async fn recover(&mut self, message: &str) {
        self.set_phase(Phase::ErrorRecovery);
        self.detach_stream();
        self.awaiting_first_event = None;
        self.context.store.stop_streaming(self.id());
        self.context.cursors.remove(self.id());
        self.context.store.record_error(self.id(), message);
        self.reconcile().await;
        self.context.store.unlock_input(self.id());
        self.set_phase(Phase::Idle);
    }

    /// Replace local state with the authoritative message list.
    async fn reconcile(&mut self) {
        match self.context.backend.fetch_messages(self.id()).await {
            Ok(messages) => self.context.store.replace_messages(self.id(), messages),
            Err(e) => tracing::warn!(
                "Session {}: failed to fetch messages for reconciliation: {}",
                self.session_id,
                e
            ),
        }
    }

    fn teardown(&mut self) {
        self.detach_stream();
        self.set_phase(Phase::Idle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::TransportSender;
    use crate::core::{Message, MessageId, Role, Session, Step};
    use crate::session::store::{InputState, StoreEvent};
    use async_trait::async_trait;
    use reqwest::StatusCode;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::broadcast;

    #[derive(Default)]
    struct MockBackend {
        statuses: Mutex<VecDeque<ResponseStatus>>,
        fail_probe: Mutex<bool>,
        /// Probes never answer.
        hang_probe: Mutex<bool>,
        enqueue_error: Mutex<Option<StatusCode>>,
        /// Ignore the requested offset and replay from the start.
        replay_from_start: Mutex<bool>,
        calls: Mutex<Vec<String>>,
        senders: Mutex<Vec<TransportSender<StreamEvent>>>,
        messages: Mutex<Vec<Message>>,
    }

    impl MockBackend {
        fn with_statuses(statuses: Vec<ResponseStatus>) -> Arc<Self> {
            let backend = Self::default();
            *backend.statuses.lock().unwrap() = statuses.into();
            Arc::new(backend)
        }

        fn record(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn sender(&self, index: usize) -> TransportSender<StreamEvent> {
            self.senders.lock().unwrap()[index].clone()
        }

        fn stream(&self, session_id: &str, origin: Cursor) -> SessionStream {
            let (tx, stream) = SessionStream::channel(session_id, origin);
            self.senders.lock().unwrap().push(tx);
            stream
        }
    }

    #[async_trait]
    impl AgentBackend for MockBackend {
        async fn probe_status(&self, session_id: &str) -> Result<ResponseStatus, ClientError> {
            self.record(format!("probe:{session_id}"));
            let hang = *self.hang_probe.lock().unwrap();
            if hang {
                std::future::pending::<()>().await;
            }
            if *self.fail_probe.lock().unwrap() {
                return Err(ClientError::Network("connection refused".to_string()));
            }
            Ok(self.statuses.lock().unwrap().pop_front().unwrap_or_default())
        }

        async fn establish_context(&self, session_id: &str) -> Result<(), ClientError> {
            self.record(format!("connect:{session_id}"));
            Ok(())
        }

        async fn send_new_message(&self, session_id: &str, content: &str) -> Result<SessionStream, ClientError> {
            self.record(format!("send:{content}"));
            Ok(self.stream(session_id, Cursor::START))
        }

        async fn enqueue_message(&self, _session_id: &str, content: &str) -> Result<(), ClientError> {
            self.record(format!("enqueue:{content}"));
            match *self.enqueue_error.lock().unwrap() {
                Some(status) => Err(ClientError::Status {
                    status,
                    body: "no active agent".to_string(),
                }),
                None => Ok(()),
            }
        }

        async fn open_event_stream(&self, session_id: &str, from: Cursor) -> Result<SessionStream, ClientError> {
            self.record(format!("resume:{}:{}", from.chunks_delivered, from.steps_delivered));
            let origin = if *self.replay_from_start.lock().unwrap() {
                Cursor::START
            } else {
                from
            };
            Ok(self.stream(session_id, origin))
        }

        async fn update_context(&self, session_id: &str, cwd: &str) -> Result<Session, ClientError> {
            self.record(format!("cwd:{cwd}"));
            let mut session = Session::new(session_id);
            session.cwd = Some(cwd.to_string());
            Ok(session)
        }

        async fn abort(&self, session_id: &str) -> Result<(), ClientError> {
            self.record(format!("abort:{session_id}"));
            Ok(())
        }

        async fn fetch_messages(&self, session_id: &str) -> Result<Vec<Message>, ClientError> {
            self.record(format!("fetch:{session_id}"));
            Ok(self.messages.lock().unwrap().clone())
        }
    }

    fn context(backend: Arc<MockBackend>) -> SessionContext {
        SessionContext {
            backend,
            activation: ActivationSet::new(),
            cursors: CursorStore::new(),
            store: ChatStore::new(),
        }
    }

    fn assistant(content: &str) -> Message {
        Message {
            id: MessageId::Server("m1".to_string()),
            role: Role::Assistant,
            content: content.to_string(),
            timestamp: chrono::DateTime::UNIX_EPOCH,
            steps: None,
        }
    }

    fn delta(content: &str) -> Result<StreamEvent, ClientError> {
        Ok(StreamEvent::Delta {
            content: content.to_string(),
        })
    }

    fn done() -> Result<StreamEvent, ClientError> {
        Ok(StreamEvent::Done(DonePayload::default()))
    }

    async fn wait_for(rx: &mut broadcast::Receiver<StoreEvent>, matches: impl Fn(&StoreEvent) -> bool) -> StoreEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.unwrap();
                if matches(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("store event not published")
    }

    async fn wait_idle(handle: &CoordinatorHandle) {
        tokio::time::timeout(Duration::from_secs(5), handle.wait_idle())
            .await
            .expect("coordinator never went idle");
    }

    #[tokio::test]
    async fn first_send_locks_input_until_first_step() {
        let backend = MockBackend::with_statuses(vec![]);
        *backend.messages.lock().unwrap() = vec![assistant("Hi")];
        let ctx = context(backend.clone());
        let mut events = ctx.store.subscribe();
        let handle = CoordinatorHandle::spawn("s1", ctx.clone());

        assert_eq!(handle.send("hello").await.unwrap(), SendOutcome::Started);
        assert!(!ctx.store.input_state("s1").is_enabled());
        assert!(!ctx.activation.is_ready("s1"));
        assert_eq!(
            backend.calls(),
            vec!["probe:s1", "connect:s1", "probe:s1", "send:hello"]
        );

        let tx = backend.sender(0);
        tx.send(Ok(StreamEvent::Step(Step::new("Thinking...")))).await.unwrap();
        wait_for(&mut events, |e| matches!(e, StoreEvent::StepAppended { .. })).await;
        assert_eq!(ctx.store.input_state("s1"), InputState::Enabled);
        assert!(ctx.activation.is_ready("s1"));

        tx.send(delta("Hi")).await.unwrap();
        tx.send(done()).await.unwrap();
        wait_idle(&handle).await;

        let view = ctx.store.snapshot("s1");
        assert!(view.streaming.is_none());
        assert_eq!(view.messages, vec![assistant("Hi")]);
        assert_eq!(ctx.cursors.get("s1"), None);
        assert!(tx.is_closed());
        assert_eq!(backend.calls().last().map(String::as_str), Some("fetch:s1"));
    }

    #[tokio::test]
    async fn context_change_before_first_event_keeps_session_not_ready() {
        let backend = MockBackend::with_statuses(vec![]);
        let ctx = context(backend.clone());
        let mut events = ctx.store.subscribe();
        let handle = CoordinatorHandle::spawn("s1", ctx.clone());

        handle.send("hello").await.unwrap();
        ctx.activation.clear_ready("s1");

        let tx = backend.sender(0);
        tx.send(Ok(StreamEvent::Step(Step::new("Thinking...")))).await.unwrap();
        wait_for(&mut events, |e| matches!(e, StoreEvent::StepAppended { .. })).await;
        assert_eq!(ctx.store.input_state("s1"), InputState::Enabled);
        assert!(!ctx.activation.is_ready("s1"));

        tx.send(done()).await.unwrap();
        wait_idle(&handle).await;
        assert!(!ctx.activation.is_ready("s1"));

        // The next send has to establish the new context.
        handle.send("again").await.unwrap();
        let connects = backend.calls().iter().filter(|c| *c == "connect:s1").count();
        assert_eq!(connects, 2);
        assert!(!ctx.store.input_state("s1").is_enabled());
    }

    #[tokio::test]
    async fn ready_session_sends_without_locking() {
        let backend = MockBackend::with_statuses(vec![]);
        let ctx = context(backend.clone());
        ctx.activation.mark_ready("s1");
        let mut events = ctx.store.subscribe();
        let handle = CoordinatorHandle::spawn("s1", ctx.clone());

        handle.send("again").await.unwrap();
        let tx = backend.sender(0);
        tx.send(delta("ok")).await.unwrap();
        tx.send(done()).await.unwrap();
        wait_idle(&handle).await;

        assert_eq!(backend.calls()[..2], ["probe:s1", "send:again"]);
        while let Ok(event) = events.try_recv() {
            assert!(
                !matches!(event, StoreEvent::InputChanged { .. }),
                "input should never have been locked"
            );
        }
    }

    #[tokio::test]
    async fn resume_appends_after_reported_offset() {
        let backend = MockBackend::with_statuses(vec![ResponseStatus::active(5, 2)]);
        let ctx = context(backend.clone());
        ctx.store.begin_streaming("s1");
        ctx.store.append_content("s1", "Hello");
        ctx.store.stop_streaming("s1");
        let mut events = ctx.store.subscribe();
        let handle = CoordinatorHandle::spawn("s1", ctx.clone());

        assert_eq!(
            handle.attach().await.unwrap(),
            AttachOutcome::Resumed {
                from: Cursor::new(5, 2)
            }
        );
        assert_eq!(backend.calls(), vec!["probe:s1", "resume:5:2"]);

        backend.sender(0).send(delta(" world")).await.unwrap();
        wait_for(&mut events, |e| matches!(e, StoreEvent::ContentAppended { .. })).await;

        let view = ctx.store.snapshot("s1");
        assert!(view.is_streaming());
        assert_eq!(view.streaming.unwrap().content, "Hello world");
        assert_eq!(ctx.cursors.get("s1"), Some(Cursor::new(6, 2)));
        assert_eq!(handle.phase(), Phase::Streaming);
    }

    #[tokio::test]
    async fn replayed_events_are_applied_once() {
        let backend = MockBackend::with_statuses(vec![ResponseStatus::active(2, 0)]);
        *backend.replay_from_start.lock().unwrap() = true;
        let ctx = context(backend.clone());
        ctx.store.begin_streaming("s1");
        ctx.store.append_content("s1", "ab");
        let mut events = ctx.store.subscribe();
        let handle = CoordinatorHandle::spawn("s1", ctx.clone());

        handle.attach().await.unwrap();
        let tx = backend.sender(0);
        for content in ["a", "b", "c"] {
            tx.send(delta(content)).await.unwrap();
        }
        let appended = wait_for(&mut events, |e| matches!(e, StoreEvent::ContentAppended { .. })).await;

        assert_eq!(
            appended,
            StoreEvent::ContentAppended {
                session_id: "s1".to_string(),
                content: "c".to_string()
            }
        );
        assert_eq!(ctx.store.snapshot("s1").streaming.unwrap().content, "abc");
        assert_eq!(ctx.cursors.get("s1"), Some(Cursor::new(3, 0)));
    }

    #[tokio::test]
    async fn reattach_closes_previous_transport() {
        let backend = MockBackend::with_statuses(vec![
            ResponseStatus::active(0, 0),
            ResponseStatus::active(0, 0),
        ]);
        let handle = CoordinatorHandle::spawn("s1", context(backend.clone()));

        handle.attach().await.unwrap();
        handle.attach().await.unwrap();

        assert!(backend.sender(0).is_closed());
        assert!(!backend.sender(1).is_closed());
    }

    #[tokio::test]
    async fn send_during_stream_is_enqueued() {
        let backend = MockBackend::with_statuses(vec![]);
        let ctx = context(backend.clone());
        ctx.activation.mark_ready("s1");
        let handle = CoordinatorHandle::spawn("s1", ctx);

        handle.send("first").await.unwrap();
        assert_eq!(handle.send("second").await.unwrap(), SendOutcome::Enqueued);

        let calls = backend.calls();
        assert_eq!(calls.iter().filter(|c| c.starts_with("send:")).count(), 1);
        assert_eq!(calls.last().map(String::as_str), Some("enqueue:second"));
    }

    #[tokio::test]
    async fn enqueue_conflict_falls_back_to_new_response() {
        let backend = MockBackend::with_statuses(vec![ResponseStatus::active(3, 1)]);
        *backend.enqueue_error.lock().unwrap() = Some(StatusCode::CONFLICT);
        let ctx = context(backend.clone());
        ctx.activation.mark_ready("s1");
        let handle = CoordinatorHandle::spawn("s1", ctx);

        assert_eq!(handle.send("late").await.unwrap(), SendOutcome::Started);
        assert_eq!(
            backend.calls(),
            vec!["probe:s1", "resume:3:1", "enqueue:late", "send:late"]
        );
        assert!(backend.sender(0).is_closed());
    }

    #[tokio::test]
    async fn dropped_stream_reconciles_without_retry() {
        let backend = MockBackend::with_statuses(vec![]);
        *backend.messages.lock().unwrap() = vec![assistant("partial")];
        let ctx = context(backend.clone());
        let handle = CoordinatorHandle::spawn("s1", ctx.clone());

        handle.send("hello").await.unwrap();
        backend
            .sender(0)
            .send(Err(ClientError::Network("reset by peer".to_string())))
            .await
            .unwrap();
        wait_idle(&handle).await;

        let view = ctx.store.snapshot("s1");
        assert!(view.last_error.unwrap().contains("reset by peer"));
        assert_eq!(view.messages, vec![assistant("partial")]);
        assert!(view.input.is_enabled());
        assert!(!ctx.activation.is_ready("s1"));
        let calls = backend.calls();
        assert_eq!(calls.iter().filter(|c| c.starts_with("send:")).count(), 1);
    }

    #[tokio::test]
    async fn probe_failure_keeps_input_locked() {
        let backend = MockBackend::with_statuses(vec![]);
        *backend.fail_probe.lock().unwrap() = true;
        let ctx = context(backend.clone());
        let handle = CoordinatorHandle::spawn("s1", ctx.clone());

        assert!(matches!(
            handle.send("hello").await,
            Err(ClientError::Network(_))
        ));
        assert!(!ctx.store.input_state("s1").is_enabled());
        assert_eq!(handle.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn abort_closes_stream_then_tells_backend() {
        let backend = MockBackend::with_statuses(vec![]);
        let ctx = context(backend.clone());
        let handle = CoordinatorHandle::spawn("s1", ctx.clone());

        handle.send("long task").await.unwrap();
        handle.abort().await.unwrap();

        assert!(backend.sender(0).is_closed());
        assert!(ctx.store.input_state("s1").is_enabled());
        assert_eq!(
            backend.calls()[backend.calls().len() - 2..],
            ["fetch:s1", "abort:s1"]
        );
        assert_eq!(handle.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn abort_interrupts_pending_send() {
        let backend = MockBackend::with_statuses(vec![]);
        *backend.hang_probe.lock().unwrap() = true;
        let ctx = context(backend.clone());
        let handle = CoordinatorHandle::spawn("s1", ctx.clone());

        let mut phase = handle.watch_phase();
        let sending = tokio::spawn({
            let handle = handle.clone();
            async move { handle.send("hello").await }
        });
        tokio::time::timeout(Duration::from_secs(5), phase.wait_for(|p| *p == Phase::Probing))
            .await
            .expect("send never started probing")
            .unwrap();
        assert!(!ctx.store.input_state("s1").is_enabled());

        tokio::time::timeout(Duration::from_secs(5), handle.abort())
            .await
            .expect("abort waited behind the send")
            .unwrap();
        let result = sending.await.unwrap();
        assert!(matches!(result, Err(ClientError::Aborted(_))));

        assert_eq!(backend.calls(), vec!["probe:s1", "fetch:s1", "abort:s1"]);
        assert!(ctx.store.input_state("s1").is_enabled());
        assert_eq!(handle.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn locking_one_session_leaves_others_untouched() {
        let backend = MockBackend::with_statuses(vec![]);
        let ctx = context(backend.clone());
        let mut events = ctx.store.subscribe();
        let a = CoordinatorHandle::spawn("a", ctx.clone());

        a.send("hello").await.unwrap();
        assert!(!ctx.store.input_state("a").is_enabled());
        assert_eq!(ctx.store.input_state("b"), InputState::Enabled);
        assert!(!ctx.store.snapshot("b").is_streaming());

        while let Ok(event) = events.try_recv() {
            assert_eq!(event.session_id(), "a", "unexpected event {event:?}");
        }
    }

    #[tokio::test]
    async fn sessions_do_not_share_failures() {
        let backend = MockBackend::with_statuses(vec![]);
        let ctx = context(backend.clone());
        ctx.activation.mark_ready("a");
        ctx.activation.mark_ready("b");
        let mut events = ctx.store.subscribe();
        let a = CoordinatorHandle::spawn("a", ctx.clone());
        let b = CoordinatorHandle::spawn("b", ctx.clone());

        a.send("one").await.unwrap();
        b.send("two").await.unwrap();
        backend
            .sender(0)
            .send(Err(ClientError::Network("gone".to_string())))
            .await
            .unwrap();
        wait_idle(&a).await;

        backend.sender(1).send(delta("still here")).await.unwrap();
        wait_for(&mut events, |e| {
            matches!(e, StoreEvent::ContentAppended { session_id, .. } if session_id == "b")
        })
        .await;

        assert!(ctx.store.snapshot("b").is_streaming());
        assert!(ctx.store.snapshot("b").last_error.is_none());
        assert_eq!(b.phase(), Phase::Streaming);
    }

    #[tokio::test]
    async fn shutdown_closes_owned_transport() {
        let backend = MockBackend::with_statuses(vec![]);
        let handle = CoordinatorHandle::spawn("s1", context(backend.clone()));

        handle.send("x").await.unwrap();
        handle.shutdown().await;

        assert!(backend.sender(0).is_closed());
        assert!(matches!(
            handle.send("y").await,
            Err(ClientError::Shutdown(_))
        ));
    }
}
