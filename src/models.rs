//! Core data models shared by the client, the server and the LLM provider.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who produced a transcript entry. Controls the style class it renders with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    User,
    Assistant,
    Error,
}

/// One transcript entry. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(content: impl Into<String>, kind: MessageKind) -> Self {
        Self {
            content: content.into(),
            kind,
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(content, MessageKind::User)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(content, MessageKind::Assistant)
    }
}

/// The single blob written to client storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedTranscript {
    pub messages: Vec<Message>,
    pub timestamp: DateTime<Utc>,
}

/// A stored question/answer pair that can be selected as context.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextSegment {
    pub id: String,
    pub question: String,
    pub content: String,
    pub created_at: i64,
}

/// Listing shape returned by `GET /context`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SegmentSummary {
    pub id: String,
    pub description: String,
    pub active: bool,
}

/// Role of a message sent to the chat completions API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Structured rewrite returned by the humanize model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanizeResult {
    pub humanized_text: String,
    #[serde(default)]
    pub changes_made: Vec<String>,
    #[serde(default)]
    pub confidence_score: f64,
    #[serde(default)]
    pub tone: Option<String>,
}

/// Body of a successful `POST /api/humanize`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanizeResponse {
    pub status: String,
    pub humanized_text: String,
    pub confidence_score: f64,
    #[serde(default)]
    pub changes_made: Vec<String>,
    #[serde(default)]
    pub tone: Option<String>,
}

/// Body of `GET /health`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    /// `"ok"` when every dependency is reachable, otherwise `"degraded"`.
    pub status: String,
    pub version: String,
    pub dependencies: DependencyHealth,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyHealth {
    pub llm: String,
    pub context_store: String,
}

/// A sanitized prompt merged with the context it should be answered in.
#[derive(Debug, Clone, PartialEq)]
pub struct EnhancedInput {
    pub prompt: String,
    /// Rendered context passages, oldest first.
    pub context: Vec<String>,
}
