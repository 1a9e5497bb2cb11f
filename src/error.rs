//! Typed error taxonomy for the chat client and input validation.
//!
//! Validation errors are user-correctable and never reach the server.
//! Transport errors (including stream decode failures) are converted to an
//! assistant-style transcript message at the controller boundary.
//! Persistence errors are logged and swallowed.

use thiserror::Error;

/// Shown when a failure carries no usable text of its own.
pub const GENERIC_ERROR_MESSAGE: &str = "Sorry, something went wrong. Please try again.";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Message must be at least {min} characters long")]
    TooShort { min: usize },

    #[error("Message cannot exceed {max} characters")]
    TooLong { max: usize },

    #[error("Message contains invalid characters")]
    InvalidCharacters,

    #[error("Rate limit exceeded. Please try again in {retry_after} seconds.")]
    RateLimited { retry_after: u64 },
}

impl ValidationError {
    /// Short machine-readable label.
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::TooShort { .. } => "too short",
            ValidationError::TooLong { .. } => "too long",
            ValidationError::InvalidCharacters => "invalid characters",
            ValidationError::RateLimited { .. } => "rate limited",
        }
    }

    pub fn retry_after(&self) -> Option<u64> {
        match self {
            ValidationError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Network error: {0}")]
    Network(String),

    /// Non-success HTTP status. `message` is the server's `error` field when it sent one.
    #[error("{message}")]
    Status { status: u16, message: String },

    /// The server reported a failure inside an otherwise successful stream.
    #[error("{0}")]
    Server(String),

    /// A chunk could not be decoded. Fatal to the current stream.
    #[error("Failed to decode response: {0}")]
    StreamDecode(String),

    /// The request was superseded before it produced a response.
    #[error("Request cancelled")]
    Cancelled,
}

impl TransportError {
    /// Text to show the user, falling back to a generic message when empty.
    pub fn user_message(&self) -> String {
        let text = self.to_string();
        if text.trim().is_empty() {
            GENERIC_ERROR_MESSAGE.to_string()
        } else {
            text
        }
    }
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("storage read failed: {0}")]
    Read(#[source] std::io::Error),

    #[error("storage write failed: {0}")]
    Write(#[source] std::io::Error),

    #[error("stored transcript is malformed: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("transcript could not be serialized: {0}")]
    Serialize(#[source] serde_json::Error),
}
