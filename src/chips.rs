//! Smart chips: inline commands embedded in chat text.
//!
//! A chip looks like `@type[key=value,flag]{content}`. The bracketed
//! parameter list is optional; a bare `flag` means `flag=true`.
//!
//! ```text
//! Hello @humanize[tone=formal]{Please improve this text.} Thanks!
//! ```
//!
//! [`ChipDetector::process`] runs each chip through its registered
//! [`ChipHandler`] and splices the handler's display text back into the
//! message, producing a chip response: the rewritten text plus one result
//! per chip.

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock};

use crate::llm::{self, LlmProvider};
use crate::models::EnhancedInput;

fn chip_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"@(\w+)(?:\[([\w=,]+)\])?\s*\{([^}]+)\}").expect("chip pattern is valid")
    })
}

/// One chip found in a message. Offsets are byte offsets into the message.
#[derive(Debug, Clone, PartialEq)]
pub struct ChipMatch {
    pub chip_type: String,
    pub content: String,
    pub start: usize,
    pub end: usize,
    pub parameters: BTreeMap<String, String>,
}

/// What a handler produced for a chip.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChipOutput {
    /// Replaces the chip in the message.
    pub display_text: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChipResult {
    #[serde(rename = "type")]
    pub chip_type: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ChipOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A message with its chips resolved.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChipResponse {
    pub processed_text: String,
    pub chip_results: Vec<ChipResult>,
}

impl ChipResponse {
    /// True when the message contained at least one chip.
    pub fn has_chips(&self) -> bool {
        !self.chip_results.is_empty()
    }

    /// The first chip error, when no chip resolved.
    pub fn failure(&self) -> Option<&str> {
        if self.chip_results.iter().any(|r| r.success) {
            return None;
        }
        self.chip_results.iter().find_map(|r| r.error.as_deref())
    }
}

#[async_trait]
pub trait ChipHandler: Send + Sync {
    fn chip_type(&self) -> &str;
    fn description(&self) -> &str;
    async fn handle(&self, content: &str, parameters: &BTreeMap<String, String>) -> Result<ChipOutput>;
}

#[derive(Default)]
pub struct ChipRegistry {
    handlers: HashMap<String, Arc<dyn ChipHandler>>,
}

impl ChipRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `@humanize` handler.
    pub fn with_builtins(provider: Arc<dyn LlmProvider>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(HumanizeHandler::new(provider)));
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn ChipHandler>) {
        self.handlers
            .insert(handler.chip_type().to_string(), handler);
    }

    pub fn get(&self, chip_type: &str) -> Option<Arc<dyn ChipHandler>> {
        self.handlers.get(chip_type).cloned()
    }

    /// `(type, description)` for every handler, sorted by type.
    pub fn list(&self) -> Vec<(String, String)> {
        let mut out: Vec<_> = self
            .handlers
            .values()
            .map(|h| (h.chip_type().to_string(), h.description().to_string()))
            .collect();
        out.sort();
        out
    }
}

pub struct ChipDetector {
    registry: ChipRegistry,
}

impl ChipDetector {
    pub fn new(registry: ChipRegistry) -> Self {
        Self { registry }
    }

    pub fn find_chips(&self, text: &str) -> Vec<ChipMatch> {
        chip_pattern()
            .captures_iter(text)
            .filter_map(|caps| {
                let whole = caps.get(0)?;
                Some(ChipMatch {
                    chip_type: caps[1].to_string(),
                    content: caps[3].trim().to_string(),
                    start: whole.start(),
                    end: whole.end(),
                    parameters: parse_parameters(caps.get(2).map(|m| m.as_str()).unwrap_or("")),
                })
            })
            .collect()
    }

    /// Resolves every chip, last to first so earlier offsets stay valid.
    /// A failing or unknown chip is left in place and reported.
    pub async fn process(&self, text: &str) -> ChipResponse {
        let matches = self.find_chips(text);
        let mut processed = text.to_string();
        let mut results = Vec::with_capacity(matches.len());

        for m in matches.iter().rev() {
            let Some(handler) = self.registry.get(&m.chip_type) else {
                tracing::warn!(chip = %m.chip_type, "no handler for chip type");
                results.push(ChipResult {
                    chip_type: m.chip_type.clone(),
                    success: false,
                    result: None,
                    error: Some("Handler not found".to_string()),
                });
                continue;
            };

            match handler.handle(&m.content, &m.parameters).await {
                Ok(output) => {
                    processed.replace_range(m.start..m.end, &output.display_text);
                    results.push(ChipResult {
                        chip_type: m.chip_type.clone(),
                        success: true,
                        result: Some(output),
                        error: None,
                    });
                }
                Err(e) => {
                    tracing::error!(chip = %m.chip_type, error = %e, "chip handler failed");
                    results.push(ChipResult {
                        chip_type: m.chip_type.clone(),
                        success: false,
                        result: None,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        results.reverse();
        ChipResponse {
            processed_text: processed,
            chip_results: results,
        }
    }
}

fn parse_parameters(raw: &str) -> BTreeMap<String, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| match p.split_once('=') {
            Some((k, v)) => (k.trim().to_string(), v.trim().to_string()),
            None => (p.to_string(), "true".to_string()),
        })
        .collect()
}

/// `@humanize{...}`: rewrites the content with the humanize model.
/// Recognizes a `tone` parameter.
pub struct HumanizeHandler {
    provider: Arc<dyn LlmProvider>,
}

impl HumanizeHandler {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl ChipHandler for HumanizeHandler {
    fn chip_type(&self) -> &str {
        "humanize"
    }

    fn description(&self) -> &str {
        "Humanize and improve the given text while maintaining its core meaning"
    }

    async fn handle(&self, content: &str, parameters: &BTreeMap<String, String>) -> Result<ChipOutput> {
        let input = EnhancedInput {
            prompt: content.to_string(),
            context: Vec::new(),
        };
        let result = llm::humanize(
            self.provider.as_ref(),
            &input,
            parameters.get("tone").map(String::as_str),
        )
        .await
        .map_err(|e| anyhow::anyhow!("Failed to humanize text: {}", e))?;

        let mut display = format!("✨ Humanized version:\n{}", result.humanized_text);
        if !result.changes_made.is_empty() {
            display.push_str("\n\nChanges made:\n");
            let bullets: Vec<String> = result.changes_made.iter().map(|c| format!("• {}", c)).collect();
            display.push_str(&bullets.join("\n"));
        }

        Ok(ChipOutput {
            display_text: display,
            data: serde_json::json!({
                "humanized_text": result.humanized_text,
                "original_text": content,
                "changes": result.changes_made,
                "confidence": result.confidence_score,
                "tone": result.tone,
            }),
        })
    }
}
