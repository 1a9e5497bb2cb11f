//! Presentation sinks for the chat session.

use std::io::Write;

use crate::models::{Message, MessageKind};

/// Where the session draws. Implementations keep no state beyond what they
/// need to draw what they are told.
pub trait Renderer: Send {
    /// A message was committed to the transcript.
    fn render_message(&mut self, message: &Message);

    /// Full redraw: the committed transcript plus the reply still streaming.
    fn refresh(&mut self, transcript: &[Message], pending: Option<&Message>);

    fn set_loading(&mut self, loading: bool);
    fn show_error(&mut self, message: &str);
    fn clear_error(&mut self);
    fn set_input_enabled(&mut self, enabled: bool);
    fn set_char_count(&mut self, remaining: i64);
}

/// Line-oriented terminal output. Streaming replies are printed
/// incrementally; only the unseen suffix is written on each refresh.
pub struct TerminalRenderer<W: Write + Send> {
    out: W,
    streamed: Option<String>,
}

impl TerminalRenderer<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> TerminalRenderer<W> {
    pub fn new(out: W) -> Self {
        Self { out, streamed: None }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn label(kind: MessageKind) -> &'static str {
        match kind {
            MessageKind::User => "you",
            MessageKind::Assistant => "humanizer",
            MessageKind::Error => "error",
        }
    }

    fn write(&mut self, text: &str) {
        if let Err(e) = self.out.write_all(text.as_bytes()).and_then(|_| self.out.flush()) {
            tracing::debug!(error = %e, "terminal write failed");
        }
    }
}

impl<W: Write + Send> Renderer for TerminalRenderer<W> {
    fn render_message(&mut self, message: &Message) {
        let streamed = self.streamed.take();
        if message.kind == MessageKind::Assistant && streamed.as_deref() == Some(message.content.as_str()) {
            self.write("\n");
            return;
        }
        if streamed.is_some() {
            self.write("\n");
        }
        let line = format!("[{}] {}\n", Self::label(message.kind), message.content);
        self.write(&line);
    }

    fn refresh(&mut self, _transcript: &[Message], pending: Option<&Message>) {
        let Some(pending) = pending else {
            return;
        };
        let shown = match &self.streamed {
            Some(s) if pending.content.starts_with(s.as_str()) => s.len(),
            Some(_) => {
                self.write("\n");
                0
            }
            None => {
                let prefix = format!("[{}] ", Self::label(pending.kind));
                self.write(&prefix);
                0
            }
        };
        let suffix = pending.content[shown..].to_string();
        self.write(&suffix);
        self.streamed = Some(pending.content.clone());
    }

    fn set_loading(&mut self, loading: bool) {
        if loading {
            self.write("...\n");
        }
    }

    fn show_error(&mut self, message: &str) {
        let line = format!("! {}\n", message);
        self.write(&line);
    }

    fn clear_error(&mut self) {}

    fn set_input_enabled(&mut self, enabled: bool) {
        if enabled {
            self.write("> ");
        }
    }

    fn set_char_count(&mut self, remaining: i64) {
        if remaining < 0 {
            let line = format!("! {} characters over the limit\n", -remaining);
            self.write(&line);
        }
    }
}

/// Everything a renderer was asked to do, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum RenderEvent {
    Message(Message),
    Refresh { committed: usize, pending: Option<String> },
    Loading(bool),
    Error(String),
    ClearError,
    InputEnabled(bool),
    CharCount(i64),
}

/// Records calls instead of drawing.
#[derive(Debug, Default)]
pub struct RecordingRenderer {
    pub events: Vec<RenderEvent>,
}

impl RecordingRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn errors(&self) -> Vec<&str> {
        self.events
            .iter()
            .filter_map(|e| match e {
                RenderEvent::Error(msg) => Some(msg.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn last_input_enabled(&self) -> Option<bool> {
        self.events.iter().rev().find_map(|e| match e {
            RenderEvent::InputEnabled(enabled) => Some(*enabled),
            _ => None,
        })
    }

    /// Pending contents passed to [`Renderer::refresh`], in order.
    pub fn pending_snapshots(&self) -> Vec<String> {
        self.events
            .iter()
            .filter_map(|e| match e {
                RenderEvent::Refresh {
                    pending: Some(p), ..
                } => Some(p.clone()),
                _ => None,
            })
            .collect()
    }
}

impl Renderer for RecordingRenderer {
    fn render_message(&mut self, message: &Message) {
        self.events.push(RenderEvent::Message(message.clone()));
    }

    fn refresh(&mut self, transcript: &[Message], pending: Option<&Message>) {
        self.events.push(RenderEvent::Refresh {
            committed: transcript.len(),
            pending: pending.map(|m| m.content.clone()),
        });
    }

    fn set_loading(&mut self, loading: bool) {
        self.events.push(RenderEvent::Loading(loading));
    }

    fn show_error(&mut self, message: &str) {
        self.events.push(RenderEvent::Error(message.to_string()));
    }

    fn clear_error(&mut self) {
        self.events.push(RenderEvent::ClearError);
    }

    fn set_input_enabled(&mut self, enabled: bool) {
        self.events.push(RenderEvent::InputEnabled(enabled));
    }

    fn set_char_count(&mut self, remaining: i64) {
        self.events.push(RenderEvent::CharCount(remaining));
    }
}
