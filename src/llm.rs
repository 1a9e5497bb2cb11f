//! LLM provider abstraction over OpenAI-compatible chat completion APIs.
//!
//! [`LlmProvider`] is the seam the server and the chip handlers depend on.
//! [`OpenAiCompatProvider`] talks to any endpoint that serves
//! `POST /v1/chat/completions` (LM Studio, vLLM, llama.cpp, OpenAI).
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: `retry_delay_ms * 2^attempt`
//!
//! Once retries against the primary model are exhausted, each model in
//! `llm.fallback_models` gets a single attempt, in order.
//!
//! # Streaming
//!
//! Streamed responses are server-sent events. Each `data:` line carries a
//! JSON chunk whose `choices[0].delta.content` is yielded; `data: [DONE]`
//! ends the stream and an `error` field fails it. Lines that are not valid
//! JSON are skipped with a warning.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::LlmConfig;
use crate::models::{ChatMessage, ChatRole, EnhancedInput, HumanizeResult};

/// Stream of content deltas.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

const CHAT_SYSTEM_PROMPT: &str = "You are a helpful assistant. Respond clearly and concisely to user queries. \
You can help with various tasks including writing, analysis, and general questions. \
If you encounter a command starting with '@', inform the user that special commands \
should be handled by the appropriate model.";

const HUMANIZE_SYSTEM_PROMPT: &str = r#"You are a text humanizer specialized in improving text quality.
Your task is to enhance the given text while preserving its core meaning.
Always return your response in the following JSON format:
{
    "humanized_text": "The improved version of the text",
    "changes_made": ["List of specific improvements made"],
    "confidence_score": 0.95,
    "tone": "professional/casual/academic"
}"#;

/// How long a health probe result is reused.
const HEALTH_CACHE: Duration = Duration::from_secs(60);

/// Which task a request is for. Selects model, temperature and system prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    Chat,
    Humanize,
}

impl ModelKind {
    pub fn system_prompt(&self) -> &'static str {
        match self {
            ModelKind::Chat => CHAT_SYSTEM_PROMPT,
            ModelKind::Humanize => HUMANIZE_SYSTEM_PROMPT,
        }
    }

    pub fn model<'a>(&self, config: &'a LlmConfig) -> &'a str {
        match self {
            ModelKind::Chat => &config.chat_model,
            ModelKind::Humanize => &config.humanize_model,
        }
    }

    pub fn temperature(&self, config: &LlmConfig) -> f32 {
        match self {
            ModelKind::Chat => config.temperature,
            ModelKind::Humanize => config.humanize_temperature,
        }
    }
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Primary model for `kind`, for display and health reporting.
    fn model_name(&self, kind: ModelKind) -> String;

    /// Returns the full assistant reply.
    async fn complete(&self, kind: ModelKind, messages: &[ChatMessage]) -> Result<String>;

    /// Returns the reply as a stream of content deltas.
    async fn stream(&self, kind: ModelKind, messages: &[ChatMessage]) -> Result<DeltaStream>;

    /// Whether the endpoint is reachable.
    async fn health(&self) -> bool;
}

/// Builds the message list for a prompt: system prompt, each context
/// passage as a prior assistant turn, an optional style directive, then the
/// user's text.
pub fn build_messages(kind: ModelKind, input: &EnhancedInput, style: Option<&str>) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::new(ChatRole::System, kind.system_prompt())];
    for ctx in &input.context {
        messages.push(ChatMessage::new(ChatRole::Assistant, ctx.clone()));
    }
    if let Some(style) = style.map(str::trim).filter(|s| !s.is_empty()) {
        messages.push(ChatMessage::new(
            ChatRole::System,
            format!("Write the result in a {} style.", style),
        ));
    }
    messages.push(ChatMessage::new(ChatRole::User, input.prompt.clone()));
    messages
}

/// Runs a structured rewrite and parses the model's JSON reply.
pub async fn humanize(
    provider: &dyn LlmProvider,
    input: &EnhancedInput,
    style: Option<&str>,
) -> Result<HumanizeResult> {
    let messages = build_messages(ModelKind::Humanize, input, style);
    let content = provider.complete(ModelKind::Humanize, &messages).await?;
    Ok(parse_humanize(&content))
}

/// Parses a humanize reply. Markdown code fences are tolerated; anything
/// that is not the expected JSON is returned verbatim with zero confidence.
pub fn parse_humanize(content: &str) -> HumanizeResult {
    let trimmed = strip_code_fence(content.trim());
    match serde_json::from_str::<HumanizeResult>(trimmed) {
        Ok(result) => result,
        Err(e) => {
            tracing::warn!(error = %e, "humanize reply was not valid JSON; using raw text");
            HumanizeResult {
                humanized_text: content.trim().to_string(),
                changes_made: Vec::new(),
                confidence_score: 0.0,
                tone: None,
            }
        }
    }
}

fn strip_code_fence(s: &str) -> &str {
    let Some(rest) = s.strip_prefix("```") else {
        return s;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

// ============ OpenAI-compatible provider ============

pub struct OpenAiCompatProvider {
    config: LlmConfig,
    client: reqwest::Client,
    api_key: Option<String>,
    last_health: Mutex<Option<(Instant, bool)>>,
}

impl OpenAiCompatProvider {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()?;

        let api_key = match &config.api_key_env {
            Some(var) => Some(
                std::env::var(var)
                    .map_err(|_| anyhow!("{} environment variable not set", var))?,
            ),
            None => None,
        };

        Ok(Self {
            config: config.clone(),
            client,
            api_key,
            last_health: Mutex::new(None),
        })
    }

    fn completions_url(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.config.endpoint_url.trim_end_matches('/')
        )
    }

    /// Primary model first, then fallbacks without duplicates.
    fn candidate_models(&self, kind: ModelKind) -> Vec<String> {
        let primary = kind.model(&self.config).to_string();
        let mut models = vec![primary.clone()];
        for m in &self.config.fallback_models {
            if !models.contains(m) {
                models.push(m.clone());
            }
        }
        models
    }

    /// Sends the request, retrying and falling back as described in the
    /// module docs. Returns the first successful response.
    async fn send(
        &self,
        kind: ModelKind,
        messages: &[ChatMessage],
        stream: bool,
    ) -> Result<reqwest::Response> {
        let mut last_err = None;

        for (idx, model) in self.candidate_models(kind).iter().enumerate() {
            let attempts = if idx == 0 {
                self.config.max_retries.max(1)
            } else {
                tracing::info!(model = %model, "attempting fallback model");
                1
            };

            let body = serde_json::json!({
                "model": model,
                "messages": messages,
                "temperature": kind.temperature(&self.config),
                "max_tokens": self.config.max_tokens,
                "stream": stream,
            });

            for attempt in 0..attempts {
                if attempt > 0 {
                    let delay = Duration::from_millis(
                        self.config.retry_delay_ms.saturating_mul(1 << (attempt - 1).min(5)),
                    );
                    tokio::time::sleep(delay).await;
                }

                let mut req = self
                    .client
                    .post(self.completions_url())
                    .header("Content-Type", "application/json")
                    .json(&body);
                if let Some(key) = &self.api_key {
                    req = req.header("Authorization", format!("Bearer {}", key));
                }
                // Streamed replies only bound each read, not the whole body.
                if !stream {
                    req = req.timeout(Duration::from_secs(self.config.timeout_secs));
                }

                match req.send().await {
                    Ok(response) => {
                        let status = response.status();
                        if status.is_success() {
                            return Ok(response);
                        }

                        let body_text = response.text().await.unwrap_or_default();
                        if status.as_u16() == 429 || status.is_server_error() {
                            tracing::warn!(model = %model, attempt = attempt + 1, %status, "LLM request failed");
                            last_err = Some(anyhow!("LLM API error {}: {}", status, body_text));
                            continue;
                        }

                        bail!("LLM API error {}: {}", status, body_text);
                    }
                    Err(e) => {
                        tracing::warn!(model = %model, attempt = attempt + 1, error = %e, "LLM connection failed");
                        last_err = Some(anyhow!(
                            "Failed to connect to LLM endpoint at {}: {}",
                            self.config.endpoint_url,
                            e
                        ));
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("LLM request failed after retries")))
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatProvider {
    fn model_name(&self, kind: ModelKind) -> String {
        kind.model(&self.config).to_string()
    }

    async fn complete(&self, kind: ModelKind, messages: &[ChatMessage]) -> Result<String> {
        let response = self.send(kind, messages, false).await?;
        let json: serde_json::Value = response.json().await?;
        parse_completion(&json)
    }

    async fn stream(&self, kind: ModelKind, messages: &[ChatMessage]) -> Result<DeltaStream> {
        let response = self.send(kind, messages, true).await?;

        Ok(decode_body(response.bytes_stream()))
    }

    async fn health(&self) -> bool {
        if let Ok(guard) = self.last_health.lock() {
            if let Some((at, healthy)) = *guard {
                if at.elapsed() < HEALTH_CACHE {
                    return healthy;
                }
            }
        }

        let url = format!("{}/v1/models", self.config.endpoint_url.trim_end_matches('/'));
        let healthy = match self
            .client
            .get(&url)
            .timeout(Duration::from_secs(3))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::debug!(error = %e, "LLM health probe failed");
                false
            }
        };

        if let Ok(mut guard) = self.last_health.lock() {
            *guard = Some((Instant::now(), healthy));
        }
        healthy
    }
}

/// Extracts the reply text from a non-streamed completion.
///
/// Accepts both chat (`choices[0].message.content`) and legacy completion
/// (`choices[0].text`) shapes.
pub fn parse_completion(json: &serde_json::Value) -> Result<String> {
    if let Some(err) = json.get("error") {
        bail!("Error from LLM: {}", error_text(err));
    }

    let choice = json
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .ok_or_else(|| anyhow!("Invalid LLM response: missing choices"))?;

    let content = choice
        .get("message")
        .and_then(|m| m.get("content"))
        .or_else(|| choice.get("text"))
        .and_then(|c| c.as_str())
        .ok_or_else(|| anyhow!("Invalid LLM response: missing content"))?;

    if content.is_empty() {
        bail!("Empty response content from LLM");
    }
    Ok(content.to_string())
}

fn error_text(err: &serde_json::Value) -> String {
    err.get("message")
        .and_then(|m| m.as_str())
        .map(str::to_string)
        .or_else(|| err.as_str().map(str::to_string))
        .unwrap_or_else(|| err.to_string())
}

/// Turns a streamed completion body into deltas. Ends after `[DONE]`, an
/// error payload, or the first failed read.
pub fn decode_body<S, B, E>(body: S) -> DeltaStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + 'static,
    E: Into<anyhow::Error> + 'static,
{
    let stream = body
        .scan(SseDecoder::default(), |decoder, chunk| {
            if decoder.is_done() {
                return futures::future::ready(None);
            }
            let items: Vec<Result<String>> = match chunk {
                Ok(bytes) => decoder.push(bytes.as_ref()),
                Err(e) => {
                    decoder.fail();
                    vec![Err(e.into())]
                }
            };
            futures::future::ready(Some(futures::stream::iter(items)))
        })
        .flatten();
    Box::pin(stream)
}

/// Incremental decoder for `text/event-stream` completion chunks.
///
/// Bytes are buffered until a newline so multi-byte characters split across
/// network reads decode correctly.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    done: bool,
}

impl SseDecoder {
    /// Feeds raw bytes; returns the deltas completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Result<String>> {
        let mut out = Vec::new();
        if self.done {
            return out;
        }
        self.buffer.extend_from_slice(bytes);

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim();
            if line.is_empty() || line.starts_with(':') {
                continue;
            }

            let payload = line.strip_prefix("data:").map(str::trim).unwrap_or(line);
            if payload == "[DONE]" {
                self.done = true;
                self.buffer.clear();
                break;
            }

            let json: serde_json::Value = match serde_json::from_str(payload) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(error = %e, line = %payload, "skipping undecodable stream line");
                    continue;
                }
            };

            if let Some(err) = json.get("error") {
                out.push(Err(anyhow!("Error from LLM: {}", error_text(err))));
                self.done = true;
                break;
            }

            if let Some(delta) = json
                .pointer("/choices/0/delta/content")
                .and_then(|c| c.as_str())
                .filter(|c| !c.is_empty())
            {
                out.push(Ok(delta.to_string()));
            }
        }

        out
    }

    /// Stops decoding after a transport error.
    pub fn fail(&mut self) {
        self.done = true;
        self.buffer.clear();
    }

    pub fn is_done(&self) -> bool {
        self.done
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deltas(results: Vec<Result<String>>) -> Vec<String> {
        results.into_iter().map(|r| r.unwrap()).collect()
    }

    #[test]
    fn test_sse_decoder_yields_deltas() {
        let mut dec = SseDecoder::default();
        let out = dec.push(
            b"data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n\
              data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
        );
        assert_eq!(deltas(out), vec!["Hel", "lo"]);
    }

    #[test]
    fn test_sse_decoder_handles_split_lines() {
        let mut dec = SseDecoder::default();
        assert!(dec.push(b"data: {\"choices\":[{\"delta\":").is_empty());
        let out = dec.push(b"{\"content\":\"caf\xc3\xa9\"}}]}\n");
        assert_eq!(deltas(out), vec!["café"]);
    }

    #[test]
    fn test_sse_decoder_stops_at_done() {
        let mut dec = SseDecoder::default();
        let out = dec.push(
            b"data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\ndata: [DONE]\n\
              data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n",
        );
        assert_eq!(deltas(out), vec!["a"]);
        assert!(dec.is_done());
    }

    #[test]
    fn test_sse_decoder_skips_role_only_and_bad_lines() {
        let mut dec = SseDecoder::default();
        let out = dec.push(
            b"data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\
              data: not json\n\
              : keep-alive\n\
              data: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n",
        );
        assert_eq!(deltas(out), vec!["ok"]);
    }

    #[test]
    fn test_sse_decoder_surfaces_error_payload() {
        let mut dec = SseDecoder::default();
        let out = dec.push(b"data: {\"error\":{\"message\":\"model overloaded\"}}\n");
        assert_eq!(out.len(), 1);
        let err = out.into_iter().next().unwrap().unwrap_err();
        assert!(err.to_string().contains("model overloaded"));
    }

    fn delta_line(text: &str) -> String {
        format!("data: {{\"choices\":[{{\"delta\":{{\"content\":\"{}\"}}}}]}}\n\n", text)
    }

    #[tokio::test]
    async fn test_decode_body_stops_at_first_read_error() {
        let broken = || std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "body closed");
        let chunks: Vec<std::result::Result<Vec<u8>, std::io::Error>> = vec![
            Ok(delta_line("w0 ").into_bytes()),
            Ok(delta_line("w1 ").into_bytes()),
            Err(broken()),
            Err(broken()),
            Err(broken()),
            Ok(delta_line("late").into_bytes()),
        ];

        let out: Vec<Result<String>> = decode_body(futures::stream::iter(chunks)).collect().await;
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].as_ref().unwrap(), "w0 ");
        assert_eq!(out[1].as_ref().unwrap(), "w1 ");
        assert!(out[2].as_ref().unwrap_err().to_string().contains("body closed"));
    }

    /// Serves one completion request, writing `deltas` with `gap` between them.
    async fn slow_completion_server(deltas: Vec<String>, gap: Duration) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request).to_string();
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text[..end]
                        .lines()
                        .find_map(|l| {
                            let (name, value) = l.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if request.len() >= end + 4 + length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }

            let head = "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\n";
            socket.write_all(head.as_bytes()).await.unwrap();
            for delta in deltas {
                tokio::time::sleep(gap).await;
                socket.write_all(delta_line(&delta).as_bytes()).await.unwrap();
                socket.flush().await.unwrap();
            }
            socket.write_all(b"data: [DONE]\n\n").await.unwrap();
            socket.shutdown().await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_stream_outlives_timeout_when_reads_keep_arriving() {
        let words: Vec<String> = (0..5).map(|i| format!("w{} ", i)).collect();
        let endpoint = slow_completion_server(words.clone(), Duration::from_millis(600)).await;

        let mut cfg = LlmConfig::default();
        cfg.endpoint_url = endpoint;
        cfg.timeout_secs = 1;
        cfg.max_retries = 1;
        cfg.fallback_models = Vec::new();
        let provider = OpenAiCompatProvider::new(&cfg).unwrap();

        let messages = vec![ChatMessage::new(ChatRole::User, "hello")];
        let deltas: Vec<Result<String>> = provider
            .stream(ModelKind::Chat, &messages)
            .await
            .unwrap()
            .collect()
            .await;

        let text: Vec<String> = deltas.into_iter().map(|d| d.unwrap()).collect();
        assert_eq!(text, words);
    }

    #[test]
    fn test_parse_completion_chat_and_legacy() {
        let chat = serde_json::json!({"choices":[{"message":{"role":"assistant","content":"hi"}}]});
        assert_eq!(parse_completion(&chat).unwrap(), "hi");
        let legacy = serde_json::json!({"choices":[{"text":"yo"}]});
        assert_eq!(parse_completion(&legacy).unwrap(), "yo");
    }

    #[test]
    fn test_parse_completion_errors() {
        assert!(parse_completion(&serde_json::json!({"choices": []})).is_err());
        let err = parse_completion(&serde_json::json!({"error": "boom"})).unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_parse_humanize_json_and_fence() {
        let raw = "```json\n{\"humanized_text\":\"Nice.\",\"changes_made\":[\"tone\"],\"confidence_score\":0.8}\n```";
        let parsed = parse_humanize(raw);
        assert_eq!(parsed.humanized_text, "Nice.");
        assert_eq!(parsed.changes_made, vec!["tone"]);
        assert!((parsed.confidence_score - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn test_parse_humanize_falls_back_to_raw_text() {
        let parsed = parse_humanize("Just a plain rewrite.");
        assert_eq!(parsed.humanized_text, "Just a plain rewrite.");
        assert_eq!(parsed.confidence_score, 0.0);
    }

    #[test]
    fn test_build_messages_order() {
        let input = EnhancedInput {
            prompt: "rewrite me".to_string(),
            context: vec!["Q: a\nA: b".to_string()],
        };
        let msgs = build_messages(ModelKind::Humanize, &input, Some("casual"));
        assert_eq!(msgs.len(), 4);
        assert_eq!(msgs[0].role, ChatRole::System);
        assert_eq!(msgs[1].role, ChatRole::Assistant);
        assert!(msgs[2].content.contains("casual"));
        assert_eq!(msgs[3].role, ChatRole::User);
        assert_eq!(msgs[3].content, "rewrite me");
    }

    #[test]
    fn test_candidate_models_dedup() {
        let mut cfg = LlmConfig::default();
        cfg.chat_model = "a".to_string();
        cfg.fallback_models = vec!["b".to_string(), "a".to_string(), "c".to_string()];
        let provider = OpenAiCompatProvider::new(&cfg).unwrap();
        assert_eq!(provider.candidate_models(ModelKind::Chat), vec!["a", "b", "c"]);
    }
}
