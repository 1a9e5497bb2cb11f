//! Server-side input processing.
//!
//! Every prompt that reaches the LLM passes through [`InputProcessor::process`]:
//! length and character validation, a per-user sliding-window rate limit,
//! sanitization, and merging with context from the [`ContextManager`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::config::InputConfig;
use crate::context::{ContextError, ContextManager};
use crate::error::ValidationError;
use crate::models::EnhancedInput;
use crate::validation::{Clock, RateWindow, Validator};

#[derive(Debug, thiserror::Error)]
pub enum InputError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error(transparent)]
    Context(#[from] ContextError),
}

pub struct InputProcessor {
    validator: Validator,
    config: InputConfig,
    windows: Mutex<HashMap<String, RateWindow>>,
    context: Arc<ContextManager>,
    clock: Arc<dyn Clock>,
}

impl InputProcessor {
    pub fn new(config: &InputConfig, context: Arc<ContextManager>, clock: Arc<dyn Clock>) -> Self {
        Self {
            validator: Validator::for_input(config),
            config: config.clone(),
            windows: Mutex::new(HashMap::new()),
            context,
            clock,
        }
    }

    /// Validates, rate-limits and sanitizes `text` for `user_id`, then
    /// attaches prompt context. A request counts against the user's window
    /// only when it passes validation.
    pub async fn process(&self, text: &str, user_id: &str) -> Result<EnhancedInput, InputError> {
        self.check(text, user_id)?;
        let prompt = sanitize(text);
        let context = self.context.context_for_prompt().await?;
        tracing::debug!(user = %user_id, context_passages = context.len(), "processed input");
        Ok(EnhancedInput { prompt, context })
    }

    /// Validation and rate limiting only; records the request on success.
    pub fn check(&self, text: &str, user_id: &str) -> Result<(), ValidationError> {
        self.admit(text, user_id, true)
    }

    /// Admission for chip commands. Chip syntax needs brackets and braces,
    /// so only length and rate are enforced.
    pub fn check_command(&self, text: &str, user_id: &str) -> Result<(), ValidationError> {
        self.admit(text, user_id, false)
    }

    fn admit(&self, text: &str, user_id: &str, check_chars: bool) -> Result<(), ValidationError> {
        let text = text.trim();
        self.validator.check_length(text)?;
        if check_chars {
            self.validator.check_characters(text)?;
        }

        let now = self.clock.now();
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let window = windows
            .entry(user_id.to_string())
            .or_insert_with(|| RateWindow::new(self.config.max_requests, self.config.window_seconds));
        window.check(now)?;
        window.record(now);
        Ok(())
    }
}

/// Strips anything tag-shaped and collapses whitespace runs to single spaces.
pub fn sanitize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_tag = false;
    for c in text.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}
