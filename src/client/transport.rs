//! HTTP transport to the humanizer server.
//!
//! [`Transport::send`] posts `{text}` to `/process` with the CSRF header and
//! returns the reply as a stream of decoded deltas. The body is
//! `text/event-stream`; see [`EventStreamDecoder`] for the accepted events.

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use regex::Regex;
use serde::de::DeserializeOwned;
use std::pin::Pin;
use std::sync::OnceLock;
use tokio_util::sync::CancellationToken;

use crate::csrf;
use crate::error::TransportError;
use crate::models::{HealthReport, HumanizeResponse};

/// Decoded reply deltas, in arrival order. Ends after the last delta or at
/// the first error.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Starts a submission. Resolves once the response headers arrive;
    /// deltas then flow through the returned stream. Cancelling `cancel`
    /// ends the stream at the next chunk boundary.
    async fn send(&self, text: &str, cancel: CancellationToken) -> Result<ChunkStream, TransportError>;
}

fn hidden_token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"name="csrf_token"\s+value="([^"]+)""#).expect("token pattern is valid")
    })
}

/// Pulls the CSRF token out of the hidden form field of the chat page.
pub fn extract_csrf_token(html: &str) -> Option<String> {
    hidden_token_pattern()
        .captures(html)
        .map(|caps| caps[1].to_string())
}

pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    csrf_token: String,
}

impl HttpTransport {
    /// Loads the chat page and keeps the CSRF token it carries.
    pub async fn connect(base_url: &str) -> Result<Self, TransportError> {
        let client = reqwest::Client::new();
        let base_url = base_url.trim_end_matches('/').to_string();

        let resp = client
            .get(format!("{}/", base_url))
            .send()
            .await
            .map_err(network)?;
        if !resp.status().is_success() {
            return Err(status_error(resp).await);
        }

        let from_header = resp
            .headers()
            .get(csrf::HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let html = resp.text().await.map_err(network)?;
        let csrf_token = from_header
            .or_else(|| extract_csrf_token(&html))
            .ok_or_else(|| TransportError::Server("Page did not include a CSRF token".to_string()))?;

        tracing::debug!(url = %base_url, "connected to server");
        Ok(Self {
            client,
            base_url,
            csrf_token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<T, TransportError> {
        let resp = self
            .client
            .post(self.url(path))
            .header(csrf::HEADER, &self.csrf_token)
            .json(&body)
            .send()
            .await
            .map_err(network)?;
        decode_json(resp).await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, TransportError> {
        let resp = self
            .client
            .get(self.url(path))
            .send()
            .await
            .map_err(network)?;
        decode_json(resp).await
    }

    pub async fn humanize(&self, text: &str, style: Option<&str>) -> Result<HumanizeResponse, TransportError> {
        self.post_json("/api/humanize", serde_json::json!({ "text": text, "style": style }))
            .await
    }

    pub async fn select_context(&self, ids: &[String]) -> Result<(), TransportError> {
        let _: serde_json::Value = self
            .post_json("/context", serde_json::json!({ "context_ids": ids }))
            .await?;
        Ok(())
    }

    pub async fn clear_context(&self) -> Result<(), TransportError> {
        let _: serde_json::Value = self
            .post_json("/context/clear", serde_json::json!({}))
            .await?;
        Ok(())
    }

    pub async fn health(&self) -> Result<HealthReport, TransportError> {
        self.get_json("/health").await
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, text: &str, cancel: CancellationToken) -> Result<ChunkStream, TransportError> {
        let request = self
            .client
            .post(self.url("/process"))
            .header(csrf::HEADER, &self.csrf_token)
            .json(&serde_json::json!({ "text": text }))
            .send();

        let resp = tokio::select! {
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            resp = request => resp.map_err(network)?,
        };
        if !resp.status().is_success() {
            return Err(status_error(resp).await);
        }

        let token = cancel.clone();
        let deltas = resp
            .bytes_stream()
            .scan(EventStreamDecoder::default(), |decoder, chunk| {
                let items = if decoder.is_finished() {
                    None
                } else {
                    Some(match chunk {
                        Ok(bytes) => decoder.push(&bytes),
                        Err(e) => vec![Err(network(e))],
                    })
                };
                futures::future::ready(items.map(futures::stream::iter))
            })
            .flatten()
            .take_until(async move { token.cancelled().await });

        Ok(Box::pin(deltas))
    }
}

fn network(err: reqwest::Error) -> TransportError {
    TransportError::Network(err.to_string())
}

/// Turns a non-success response into [`TransportError::Status`], using the
/// body's `error` field as the message when there is one.
async fn status_error(resp: reqwest::Response) -> TransportError {
    let status = resp.status().as_u16();
    let message = resp
        .json::<serde_json::Value>()
        .await
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or_default();
    tracing::debug!(status, message = %message, "request failed");
    TransportError::Status { status, message }
}

async fn decode_json<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, TransportError> {
    if !resp.status().is_success() {
        return Err(status_error(resp).await);
    }
    resp.json::<T>()
        .await
        .map_err(|e| TransportError::StreamDecode(e.to_string()))
}

/// Incremental decoder for the `/process` event stream.
///
/// | Event | Data | Result |
/// |-------|------|--------|
/// | (default) | JSON string | one delta |
/// | `error` | `{"status":"error","error":msg}` | [`TransportError::Server`] |
/// | `done` | `[DONE]` | end of stream |
///
/// Comment-only blocks (keep-alives) are skipped. Invalid UTF-8 or a
/// default event whose data is not a JSON string yields
/// [`TransportError::StreamDecode`]. Nothing is produced after the first
/// error or `done`.
#[derive(Default)]
pub struct EventStreamDecoder {
    buffer: Vec<u8>,
    finished: bool,
}

impl EventStreamDecoder {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Result<String, TransportError>> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }
        self.buffer.extend_from_slice(bytes);

        while let Some(end) = find_block_end(&self.buffer) {
            let block: Vec<u8> = self.buffer.drain(..end).collect();
            let block = match String::from_utf8(block) {
                Ok(b) => b,
                Err(e) => {
                    out.push(Err(TransportError::StreamDecode(e.to_string())));
                    self.finish();
                    break;
                }
            };

            match decode_block(&block) {
                Block::Skip => {}
                Block::Delta(delta) => out.push(Ok(delta)),
                Block::Done => {
                    self.finish();
                    break;
                }
                Block::Failed(err) => {
                    out.push(Err(err));
                    self.finish();
                    break;
                }
            }
        }

        out
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn finish(&mut self) {
        self.finished = true;
        self.buffer.clear();
    }
}

enum Block {
    Skip,
    Delta(String),
    Done,
    Failed(TransportError),
}

/// Index just past the blank line that ends the first complete block.
fn find_block_end(buf: &[u8]) -> Option<usize> {
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|i| i + 2);
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4);
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn decode_block(block: &str) -> Block {
    let mut event = "message";
    let mut data: Vec<&str> = Vec::new();

    for line in block.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "event" => event = value,
            "data" => data.push(value),
            _ => {}
        }
    }

    if data.is_empty() {
        return Block::Skip;
    }
    let payload = data.join("\n");

    match event {
        "done" => Block::Done,
        "error" => {
            let message = serde_json::from_str::<serde_json::Value>(&payload)
                .ok()
                .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
                .unwrap_or_default();
            Block::Failed(TransportError::Server(message))
        }
        _ => match serde_json::from_str::<String>(&payload) {
            Ok(delta) => Block::Delta(delta),
            Err(e) => Block::Failed(TransportError::StreamDecode(e.to_string())),
        },
    }
}
