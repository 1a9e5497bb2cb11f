//! Submission controller.
//!
//! A [`ChatSession`] is a state machine driven by [`ChatEvent`]s taken one
//! at a time from its own queue:
//!
//! ```text
//! Idle ──submit──▶ Validating ──ok──▶ Sending ──first chunk──▶ Streaming
//!  ▲                   │                 │                        │
//!  └────rejected───────┘                 └──────done / failed─────┘
//! ```
//!
//! Only one request is in flight. Submitting again cancels the previous
//! request and bumps the generation; events that carry an older generation
//! are dropped, so a superseded reply can never reach the transcript.

use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::client::persistence::PersistenceManager;
use crate::client::render::Renderer;
use crate::client::transport::Transport;
use crate::error::TransportError;
use crate::models::Message;
use crate::validation::{Clock, Validator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Validating,
    Sending,
    Streaming,
}

#[derive(Debug)]
pub enum ChatEvent {
    /// The input field now holds this text.
    Input(String),
    /// Submit the current input.
    Submit,
    Chunk { generation: u64, delta: String },
    Finished { generation: u64 },
    Failed { generation: u64, error: TransportError },
    /// Stop once nothing is in flight.
    Shutdown,
}

pub struct ChatSession<R: Renderer> {
    state: SessionState,
    transcript: Vec<Message>,
    input: String,
    validator: Validator,
    clock: Arc<dyn Clock>,
    persistence: PersistenceManager,
    renderer: R,
    transport: Arc<dyn Transport>,
    generation: u64,
    in_flight: Option<CancellationToken>,
    pending: Option<Message>,
    closing: bool,
    events_tx: mpsc::UnboundedSender<ChatEvent>,
    events_rx: mpsc::UnboundedReceiver<ChatEvent>,
}

impl<R: Renderer> ChatSession<R> {
    /// Restores the saved transcript and draws it.
    pub fn new(
        validator: Validator,
        clock: Arc<dyn Clock>,
        persistence: PersistenceManager,
        mut renderer: R,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let transcript = persistence.load();
        for message in &transcript {
            renderer.render_message(message);
        }
        renderer.set_char_count(validator.remaining_chars(""));
        renderer.set_input_enabled(true);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            state: SessionState::Idle,
            transcript,
            input: String::new(),
            validator,
            clock,
            persistence,
            renderer,
            transport,
            generation: 0,
            in_flight: None,
            pending: None,
            closing: false,
            events_tx,
            events_rx,
        }
    }

    /// Handle for feeding events into the session.
    pub fn sender(&self) -> mpsc::UnboundedSender<ChatEvent> {
        self.events_tx.clone()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn transcript(&self) -> &[Message] {
        &self.transcript
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    /// Processes events until [`ChatEvent::Shutdown`] has been received and
    /// the last request has settled.
    pub async fn run(mut self) -> Self {
        while !self.should_exit() {
            let Some(event) = self.events_rx.recv().await else {
                break;
            };
            self.handle(event);
        }
        self
    }

    /// Waits for and handles one event. Returns false when the queue is closed.
    pub async fn step(&mut self) -> bool {
        match self.events_rx.recv().await {
            Some(event) => {
                self.handle(event);
                true
            }
            None => false,
        }
    }

    pub fn handle(&mut self, event: ChatEvent) {
        match event {
            ChatEvent::Input(text) => self.on_input(text),
            ChatEvent::Submit => self.submit(),
            ChatEvent::Chunk { generation, delta } => self.on_chunk(generation, delta),
            ChatEvent::Finished { generation } => self.on_finished(generation),
            ChatEvent::Failed { generation, error } => self.on_failed(generation, error),
            ChatEvent::Shutdown => self.closing = true,
        }
    }

    fn should_exit(&self) -> bool {
        self.closing && self.in_flight.is_none()
    }

    fn on_input(&mut self, text: String) {
        self.input = text;
        self.renderer
            .set_char_count(self.validator.remaining_chars(&self.input));

        let text = self.input.trim();
        if text.is_empty() {
            self.renderer.clear_error();
            return;
        }
        let check = self
            .validator
            .check_length(text)
            .and_then(|_| self.validator.check_characters(text));
        match check {
            Ok(()) => self.renderer.clear_error(),
            Err(e) => self.renderer.show_error(&e.to_string()),
        }
    }

    fn submit(&mut self) {
        let resume = self.state;
        self.state = SessionState::Validating;

        let text = self.input.trim().to_string();
        let now = self.clock.now();
        if let Err(e) = self.validator.validate(&text, now) {
            tracing::debug!(reason = e.code(), "submission rejected");
            self.renderer.show_error(&e.to_string());
            self.state = resume;
            return;
        }

        self.cancel_in_flight();
        self.generation += 1;
        let token = CancellationToken::new();
        self.in_flight = Some(token.clone());
        self.state = SessionState::Sending;

        self.renderer.clear_error();
        self.renderer.set_input_enabled(false);
        self.renderer.set_loading(true);

        let message = Message::user(text.clone());
        self.renderer.render_message(&message);
        self.transcript.push(message);
        self.persistence.save(&self.transcript);

        self.input.clear();
        self.renderer.set_char_count(self.validator.remaining_chars(""));
        self.validator.record_request(now);

        tracing::debug!(generation = self.generation, chars = text.chars().count(), "submitting");
        self.spawn_request(self.generation, text, token);
    }

    fn cancel_in_flight(&mut self) {
        if let Some(token) = self.in_flight.take() {
            token.cancel();
            self.pending = None;
            tracing::debug!(generation = self.generation, "superseded in-flight request");
        }
    }

    fn spawn_request(&self, generation: u64, text: String, token: CancellationToken) {
        let transport = self.transport.clone();
        let tx = self.events_tx.clone();

        tokio::spawn(async move {
            let mut chunks = match transport.send(&text, token.clone()).await {
                Ok(chunks) => chunks,
                Err(TransportError::Cancelled) => return,
                Err(error) => {
                    let _ = tx.send(ChatEvent::Failed { generation, error });
                    return;
                }
            };

            loop {
                let next = tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    next = chunks.next() => next,
                };
                let (event, last) = match next {
                    Some(Ok(delta)) => (ChatEvent::Chunk { generation, delta }, false),
                    Some(Err(TransportError::Cancelled)) => return,
                    Some(Err(error)) => (ChatEvent::Failed { generation, error }, true),
                    None => (ChatEvent::Finished { generation }, true),
                };
                if tx.send(event).is_err() || last {
                    return;
                }
            }
        });
    }

    fn is_current(&self, generation: u64) -> bool {
        self.in_flight.is_some() && generation == self.generation
    }

    fn on_chunk(&mut self, generation: u64, delta: String) {
        if !self.is_current(generation) {
            tracing::trace!(generation, "dropping stale chunk");
            return;
        }
        if self.state == SessionState::Sending {
            self.state = SessionState::Streaming;
            self.renderer.set_loading(false);
            self.pending = Some(Message::assistant(String::new()));
        }
        if let Some(pending) = self.pending.as_mut() {
            pending.content.push_str(&delta);
        }
        self.renderer.refresh(&self.transcript, self.pending.as_ref());
    }

    fn on_finished(&mut self, generation: u64) {
        if !self.is_current(generation) {
            return;
        }
        let content = self.pending.take().map(|m| m.content).unwrap_or_default();
        if !content.trim().is_empty() {
            let message = Message::assistant(content);
            self.renderer.render_message(&message);
            self.transcript.push(message);
            self.persistence.save(&self.transcript);
        }
        self.settle();
    }

    fn on_failed(&mut self, generation: u64, error: TransportError) {
        if !self.is_current(generation) {
            return;
        }
        tracing::warn!(generation, error = %error, "submission failed");
        self.pending = None;
        let message = Message::assistant(error.user_message());
        self.renderer.render_message(&message);
        self.transcript.push(message);
        self.persistence.save(&self.transcript);
        self.settle();
    }

    fn settle(&mut self) {
        self.in_flight = None;
        self.state = SessionState::Idle;
        self.renderer.set_loading(false);
        self.renderer.set_input_enabled(true);
        self.renderer
            .set_char_count(self.validator.remaining_chars(&self.input));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::persistence::{MemoryStorage, Storage};
    use crate::client::render::{RecordingRenderer, RenderEvent};
    use crate::client::transport::ChunkStream;
    use crate::error::GENERIC_ERROR_MESSAGE;
    use crate::models::MessageKind;
    use crate::validation::ManualClock;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone, Utc};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    type Script = Result<mpsc::UnboundedReceiver<Result<String, TransportError>>, TransportError>;

    /// Hands out pre-arranged replies in submission order.
    #[derive(Default)]
    struct ScriptedTransport {
        scripts: Mutex<VecDeque<Script>>,
        sent: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        /// Queues a streamed reply fed through the returned sender.
        fn push_stream(&self) -> mpsc::UnboundedSender<Result<String, TransportError>> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.scripts.lock().unwrap().push_back(Ok(rx));
            tx
        }

        fn push_reply(&self, chunks: &[&str]) {
            let tx = self.push_stream();
            for chunk in chunks {
                tx.send(Ok(chunk.to_string())).unwrap();
            }
        }

        fn push_error(&self, error: TransportError) {
            self.scripts.lock().unwrap().push_back(Err(error));
        }

        fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, text: &str, _cancel: CancellationToken) -> Result<ChunkStream, TransportError> {
            self.sent.lock().unwrap().push(text.to_string());
            let script = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::Network("no script".to_string())));
            let rx = script?;
            let stream = futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            });
            Ok(Box::pin(stream))
        }
    }

    struct Harness {
        session: ChatSession<RecordingRenderer>,
        transport: Arc<ScriptedTransport>,
        storage: Arc<MemoryStorage>,
        clock: Arc<ManualClock>,
    }

    fn harness_with(storage: Arc<MemoryStorage>) -> Harness {
        let transport = Arc::new(ScriptedTransport::default());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap(),
        ));
        let session = ChatSession::new(
            Validator::new(2, 1000, 10, 60),
            clock.clone(),
            PersistenceManager::new(storage.clone()),
            RecordingRenderer::new(),
            transport.clone(),
        );
        Harness {
            session,
            transport,
            storage,
            clock,
        }
    }

    fn harness() -> Harness {
        harness_with(Arc::new(MemoryStorage::new()))
    }

    impl Harness {
        fn submit(&mut self, text: &str) {
            self.session.handle(ChatEvent::Input(text.to_string()));
            self.session.handle(ChatEvent::Submit);
        }

        async fn settle(&mut self) {
            while self.session.state() != SessionState::Idle {
                assert!(self.session.step().await);
            }
        }

        fn persisted(&self) -> Vec<Message> {
            PersistenceManager::new(self.storage.clone()).load()
        }
    }

    #[tokio::test]
    async fn test_successful_submission_streams_and_commits() {
        let mut h = harness();
        h.transport.push_reply(&["Hey", " there!"]);

        h.submit("make it casual");
        assert_eq!(h.session.state(), SessionState::Sending);
        assert_eq!(h.session.input(), "");
        assert_eq!(h.session.renderer().last_input_enabled(), Some(false));

        assert!(h.session.step().await);
        assert_eq!(h.session.state(), SessionState::Streaming);
        h.settle().await;

        let transcript = h.session.transcript();
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[0].kind, MessageKind::User);
        assert_eq!(transcript[1].content, "Hey there!");
        assert_eq!(
            h.session.renderer().pending_snapshots(),
            vec!["Hey", "Hey there!"]
        );
        assert_eq!(h.session.renderer().last_input_enabled(), Some(true));
        assert_eq!(h.persisted(), transcript);
        assert_eq!(h.transport.sent(), vec!["make it casual"]);
    }

    #[tokio::test]
    async fn test_user_message_persisted_before_reply() {
        let mut h = harness();
        let _reply = h.transport.push_stream();
        h.submit("hello there");
        let persisted = h.persisted();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].content, "hello there");
    }

    #[tokio::test]
    async fn test_invalid_input_is_blocked() {
        let mut h = harness();
        h.submit("a");
        assert_eq!(h.session.state(), SessionState::Idle);
        assert!(h.session.transcript().is_empty());
        assert_eq!(
            h.session.renderer().errors(),
            vec![
                "Message must be at least 2 characters long",
                "Message must be at least 2 characters long"
            ]
        );

        h.submit("no <tags> please");
        assert!(h.session.transcript().is_empty());
        assert!(h.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_keystroke_shows_and_clears_errors() {
        let mut h = harness();
        h.session.handle(ChatEvent::Input("{".to_string()));
        h.session.handle(ChatEvent::Input("fine now".to_string()));
        let events = &h.session.renderer().events;
        assert!(events.contains(&RenderEvent::CharCount(992)));
        assert_eq!(events.last(), Some(&RenderEvent::ClearError));
    }

    #[tokio::test]
    async fn test_eleventh_submission_is_rate_limited_until_window_passes() {
        let mut h = harness();
        for i in 0..10 {
            h.transport.push_reply(&[]);
            h.submit(&format!("message {}", i));
            h.clock.advance(Duration::seconds(1));
        }

        h.submit("one too many");
        let errors = h.session.renderer().errors();
        let last = errors.last().copied().unwrap_or_default();
        assert!(last.starts_with("Rate limit exceeded"), "{}", last);
        assert!(last.contains("50 seconds"), "{}", last);
        assert_eq!(h.transport.sent().len(), 10);

        h.clock.advance(Duration::seconds(60));
        h.transport.push_reply(&["ok"]);
        h.submit("one too many");
        assert_eq!(h.transport.sent().len(), 11);
        h.settle().await;
    }

    #[tokio::test]
    async fn test_new_submission_supersedes_streaming_one() {
        let mut h = harness();
        let first = h.transport.push_stream();
        let second = h.transport.push_stream();

        h.submit("first request");
        first.send(Ok("A-partial".to_string())).unwrap();
        assert!(h.session.step().await);
        assert_eq!(h.session.state(), SessionState::Streaming);

        h.submit("second request");
        let snapshots_before = h.session.renderer().pending_snapshots().len();
        first.send(Ok(" A-late".to_string())).ok();
        drop(first);
        second.send(Ok("B-reply".to_string())).unwrap();
        drop(second);
        h.settle().await;

        let contents: Vec<&str> = h
            .session
            .transcript()
            .iter()
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(contents, vec!["first request", "second request", "B-reply"]);

        let later = &h.session.renderer().pending_snapshots()[snapshots_before..];
        assert!(later.iter().all(|p| !p.contains('A')), "{:?}", later);
        assert!(h
            .persisted()
            .iter()
            .all(|m| !m.content.contains("A-partial")));
    }

    #[tokio::test]
    async fn test_server_error_adds_one_assistant_message() {
        let mut h = harness();
        h.transport.push_error(TransportError::Status {
            status: 500,
            message: String::new(),
        });

        h.submit("hello there");
        h.settle().await;

        let transcript = h.session.transcript();
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[1].kind, MessageKind::Assistant);
        assert_eq!(transcript[1].content, GENERIC_ERROR_MESSAGE);
        assert_eq!(h.session.renderer().last_input_enabled(), Some(true));
        assert_eq!(h.persisted(), transcript);
    }

    #[tokio::test]
    async fn test_decode_error_mid_stream_discards_partial() {
        let mut h = harness();
        let reply = h.transport.push_stream();
        reply.send(Ok("partial".to_string())).unwrap();
        reply
            .send(Err(TransportError::StreamDecode("bad chunk".to_string())))
            .unwrap();

        h.submit("hello there");
        h.settle().await;

        let transcript = h.session.transcript();
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[1].content, "Failed to decode response: bad chunk");
        assert!(h.persisted().iter().all(|m| m.content != "partial"));
        assert_eq!(h.persisted(), transcript);
    }

    #[tokio::test]
    async fn test_empty_reply_is_not_committed() {
        let mut h = harness();
        h.transport.push_reply(&[]);
        h.submit("hello there");
        h.settle().await;
        assert_eq!(h.session.transcript().len(), 1);
    }

    #[tokio::test]
    async fn test_restores_saved_transcript() {
        let storage = Arc::new(MemoryStorage::new());
        let saved = vec![Message::user("earlier"), Message::assistant("reply")];
        PersistenceManager::new(storage.clone()).save(&saved);

        let h = harness_with(storage);
        assert_eq!(h.session.transcript(), saved.as_slice());
        let rendered = h
            .session
            .renderer()
            .events
            .iter()
            .filter(|e| matches!(e, RenderEvent::Message(_)))
            .count();
        assert_eq!(rendered, 2);
    }

    #[tokio::test]
    async fn test_malformed_saved_transcript_starts_empty() {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .set(crate::client::persistence::STORAGE_KEY, "[[[")
            .unwrap();
        let h = harness_with(storage.clone());
        assert!(h.session.transcript().is_empty());
        assert_eq!(
            storage.get(crate::client::persistence::STORAGE_KEY).unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_run_exits_after_shutdown_once_idle() {
        let h = harness();
        h.transport.push_reply(&["done"]);
        let tx = h.session.sender();
        tx.send(ChatEvent::Input("last words".to_string())).unwrap();
        tx.send(ChatEvent::Submit).unwrap();
        tx.send(ChatEvent::Shutdown).unwrap();

        let session = h.session.run().await;
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.transcript().len(), 2);
    }
}
