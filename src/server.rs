//! HTTP server.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/` | Chat page carrying a CSRF token in a hidden field |
//! | `POST` | `/process` | Stream a reply to `{text}` as server-sent events |
//! | `POST` | `/api/humanize` | Structured rewrite of `{text, context?, style?}` |
//! | `GET`  | `/context` | List context segments with their selection state |
//! | `POST` | `/context` | Select segments: `{context_ids: [..]}` |
//! | `POST` | `/context/clear` | Clear the selection |
//! | `POST` | `/context/segments` | Store a `{question, answer}` pair |
//! | `GET`  | `/health` | Status, version and dependency health |
//!
//! All `POST` routes require a valid `X-CSRF-Token` header.
//!
//! # Error Contract
//!
//! ```json
//! { "status": "error", "error": "Message cannot exceed 2000 characters" }
//! ```
//!
//! Status codes: 400 validation, 401 CSRF, 404 unknown segment,
//! 429 rate limited, 500 context store, 503 LLM unavailable.
//!
//! # Stream format
//!
//! `/process` answers with `text/event-stream`. Each content delta is a
//! default event whose data is a JSON string. A failure after the stream has
//! started is sent as `event: error` with `{"status":"error","error":...}`;
//! a successful stream ends with `event: done`.

use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, FromRequestParts, State},
    http::{header, request::Parts, HeaderMap, HeaderName, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        Html, IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tower_http::cors::{Any, CorsLayer};

use crate::chips::{ChipDetector, ChipRegistry};
use crate::config::Config;
use crate::context::{ContextError, ContextManager, ContextStore, SqliteContextStore};
use crate::csrf::{self, CsrfKey};
use crate::error::ValidationError;
use crate::input::{InputError, InputProcessor};
use crate::llm::{self, LlmProvider, ModelKind, OpenAiCompatProvider};
use crate::models::{
    DependencyHealth, EnhancedInput, HealthReport, HumanizeResponse, SegmentSummary,
};
use crate::validation::{Clock, SystemClock};
use crate::{db, migrate};

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub llm: Arc<dyn LlmProvider>,
    pub context: Arc<ContextManager>,
    pub input: Arc<InputProcessor>,
    pub chips: Arc<ChipDetector>,
    pub csrf: CsrfKey,
}

impl AppState {
    /// Wires the collaborators together around an LLM provider and a context store.
    pub fn new(
        config: &Config,
        llm: Arc<dyn LlmProvider>,
        store: Arc<dyn ContextStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let context = Arc::new(ContextManager::new(store, &config.context));
        let input = Arc::new(InputProcessor::new(&config.input, context.clone(), clock));
        let chips = Arc::new(ChipDetector::new(ChipRegistry::with_builtins(llm.clone())));
        let csrf = match &config.server.csrf_secret {
            Some(secret) => CsrfKey::new(secret),
            None => CsrfKey::random(),
        };
        Self {
            config: Arc::new(config.clone()),
            llm,
            context,
            input,
            chips,
            csrf,
        }
    }
}

/// Starts the server on `[server].bind` and runs until the process exits.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    migrate::apply(&pool).await?;

    let llm: Arc<dyn LlmProvider> = Arc::new(OpenAiCompatProvider::new(&config.llm)?);
    let store: Arc<dyn ContextStore> = Arc::new(SqliteContextStore::new(pool));
    let state = AppState::new(config, llm, store, Arc::new(SystemClock));

    if config.server.csrf_secret.is_none() {
        tracing::warn!("server.csrf_secret not set; tokens will not survive a restart");
    }

    let app = build_router(state);
    let bind_addr = config.server.bind.clone();
    tracing::info!(bind = %bind_addr, model = %config.llm.chat_model, "server listening");
    println!("Humanizer server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(handle_index))
        .route("/process", post(handle_process))
        .route("/api/humanize", post(handle_humanize))
        .route("/context", get(handle_list_context).post(handle_select_context))
        .route("/context/clear", post(handle_clear_context))
        .route("/context/segments", post(handle_add_segment))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    status: &'static str,
    error: String,
}

/// Internal error type that converts into an Axum HTTP response.
#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            status: "error",
            error: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::BAD_REQUEST, message)
}

fn unauthorized(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::UNAUTHORIZED, message)
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::NOT_FOUND, message)
}

fn service_unavailable(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::SERVICE_UNAVAILABLE, message)
}

fn internal(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::INTERNAL_SERVER_ERROR, message)
}

impl From<ValidationError> for AppError {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::RateLimited { .. } => {
                AppError::new(StatusCode::TOO_MANY_REQUESTS, err.to_string())
            }
            other => bad_request(other.to_string()),
        }
    }
}

impl From<ContextError> for AppError {
    fn from(err: ContextError) -> Self {
        match err {
            ContextError::Store(e) => {
                tracing::error!(error = %e, "context store failure");
                internal("Failed to access context store")
            }
            other => bad_request(other.to_string()),
        }
    }
}

impl From<InputError> for AppError {
    fn from(err: InputError) -> Self {
        match err {
            InputError::Invalid(e) => e.into(),
            InputError::Context(e) => e.into(),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(err: JsonRejection) -> Self {
        tracing::debug!(error = %err, "rejected request body");
        bad_request("Invalid request format")
    }
}

fn require_csrf(state: &AppState, headers: &HeaderMap) -> Result<(), AppError> {
    let token = headers
        .get(csrf::HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| unauthorized("Missing CSRF token"))?;
    if state.csrf.verify(token) {
        Ok(())
    } else {
        Err(unauthorized("Invalid CSRF token"))
    }
}

/// Identifies the caller for rate limiting: the first `X-Forwarded-For`
/// hop, else the peer address, else `"anonymous"`.
pub struct ClientId(pub String);

impl<S: Send + Sync> FromRequestParts<S> for ClientId {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(forwarded) = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            return Ok(ClientId(forwarded.to_string()));
        }
        if let Some(ConnectInfo(addr)) = parts.extensions.get::<ConnectInfo<SocketAddr>>() {
            return Ok(ClientId(addr.ip().to_string()));
        }
        Ok(ClientId("anonymous".to_string()))
    }
}

// ============ GET / ============

async fn handle_index(State(state): State<AppState>) -> impl IntoResponse {
    let token = state.csrf.issue();
    let model = state.llm.model_name(ModelKind::Chat);
    let page = INDEX_TEMPLATE
        .replace("{{csrf_token}}", &token)
        .replace("{{model_info}}", &format!("Connected to model: {}", model));
    (
        [(HeaderName::from_static("x-csrf-token"), token)],
        Html(page),
    )
}

const INDEX_TEMPLATE: &str = r#"<!doctype html>
<html lang="en">
<head><meta charset="utf-8"><title>Text Humanizer</title></head>
<body>
  <main id="chat">
    <p class="model-info">{{model_info}}</p>
    <div id="messages"></div>
    <form id="chat-form">
      <input type="hidden" name="csrf_token" value="{{csrf_token}}">
      <textarea id="message-input" name="text" maxlength="1000"></textarea>
      <span id="char-count"></span>
      <button type="submit" id="send-button">Send</button>
    </form>
  </main>
</body>
</html>
"#;

// ============ POST /process ============

#[derive(Deserialize)]
pub struct ProcessRequest {
    #[serde(default)]
    pub text: String,
}

async fn handle_process(
    State(state): State<AppState>,
    ClientId(user): ClientId,
    headers: HeaderMap,
    body: Result<Json<ProcessRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    require_csrf(&state, &headers)?;
    let Json(req) = body?;

    let text = req.text.trim();
    if text.is_empty() {
        return Err(bad_request("No text provided"));
    }

    if !state.chips.find_chips(text).is_empty() {
        state.input.check_command(text, &user)?;
        tracing::info!(user = %user, "processing chip command");
        let response = state.chips.process(text).await;
        let first = match response.failure() {
            Some(err) => error_event(err),
            None => delta_event(&response.processed_text),
        };
        return Ok(sse_response(stream::iter(vec![first, done_event()])));
    }

    let input = state.input.process(text, &user).await?;
    tracing::info!(user = %user, chars = text.chars().count(), "processing text");

    let messages = llm::build_messages(ModelKind::Chat, &input, None);
    let deltas = state
        .llm
        .stream(ModelKind::Chat, &messages)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "LLM stream could not start");
            service_unavailable("Could not connect to LLM service. Please try again.")
        })?;

    let reply = Arc::new(Mutex::new(String::new()));
    let failed = Arc::new(AtomicBool::new(false));

    let body_events = {
        let reply = reply.clone();
        let failed = failed.clone();
        deltas.scan(false, move |stopped, item| {
            if *stopped {
                return futures::future::ready(None);
            }
            let event = match item {
                Ok(delta) => {
                    if let Ok(mut buf) = reply.lock() {
                        buf.push_str(&delta);
                    }
                    delta_event(&delta)
                }
                Err(e) => {
                    tracing::error!(error = %e, "error in stream generation");
                    failed.store(true, Ordering::SeqCst);
                    *stopped = true;
                    error_event(&e.to_string())
                }
            };
            futures::future::ready(Some(event))
        })
    };

    let context = state.context.clone();
    let question = input.prompt.clone();
    let finish = stream::once(async move {
        let answer = reply.lock().map(|r| r.clone()).unwrap_or_default();
        if !failed.load(Ordering::SeqCst) && !answer.trim().is_empty() {
            if let Err(e) = context.add_qa_pair(&question, &answer).await {
                tracing::warn!(error = %e, "could not store QA pair");
            }
        }
        done_event()
    });

    Ok(sse_response(body_events.chain(finish)))
}

fn delta_event(delta: &str) -> Result<Event, Infallible> {
    let data = serde_json::to_string(delta).unwrap_or_else(|_| "\"\"".to_string());
    Ok(Event::default().data(data))
}

fn error_event(message: &str) -> Result<Event, Infallible> {
    let body = serde_json::json!({ "status": "error", "error": message });
    Ok(Event::default().event("error").data(body.to_string()))
}

fn done_event() -> Result<Event, Infallible> {
    Ok(Event::default().event("done").data("[DONE]"))
}

fn sse_response<S>(events: S) -> Response
where
    S: futures::Stream<Item = Result<Event, Infallible>> + Send + 'static,
{
    (
        [
            (header::CACHE_CONTROL, "no-cache, no-transform"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        Sse::new(events).keep_alive(KeepAlive::default()),
    )
        .into_response()
}

// ============ POST /api/humanize ============

#[derive(Deserialize)]
pub struct HumanizeRequest {
    #[serde(default)]
    pub text: String,
    /// Extra passage to condition the rewrite on, ahead of stored context.
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub style: Option<String>,
}

async fn handle_humanize(
    State(state): State<AppState>,
    ClientId(user): ClientId,
    headers: HeaderMap,
    body: Result<Json<HumanizeRequest>, JsonRejection>,
) -> Result<Json<HumanizeResponse>, AppError> {
    require_csrf(&state, &headers)?;
    let Json(req) = body?;

    let text = req.text.trim();
    if text.is_empty() {
        return Err(bad_request("No text provided"));
    }

    let processed = state.input.process(text, &user).await?;
    let mut context = Vec::new();
    if let Some(extra) = req.context.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
        context.push(extra.to_string());
    }
    context.extend(processed.context);
    let input = EnhancedInput {
        prompt: processed.prompt,
        context,
    };

    let result = llm::humanize(state.llm.as_ref(), &input, req.style.as_deref())
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "humanize request failed");
            service_unavailable("LLM service unavailable")
        })?;

    Ok(Json(HumanizeResponse {
        status: "success".to_string(),
        humanized_text: result.humanized_text,
        confidence_score: result.confidence_score,
        changes_made: result.changes_made,
        tone: result.tone,
    }))
}

// ============ Context ============

async fn handle_list_context(
    State(state): State<AppState>,
) -> Result<Json<Vec<SegmentSummary>>, AppError> {
    Ok(Json(state.context.list_segments().await?))
}

#[derive(Deserialize)]
pub struct SelectContextRequest {
    #[serde(default)]
    pub context_ids: Vec<String>,
}

async fn handle_select_context(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<SelectContextRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, AppError> {
    require_csrf(&state, &headers)?;
    let Json(req) = body?;

    if !state.context.select(&req.context_ids).await? {
        return Err(not_found("Some requested segment IDs were not found"));
    }
    Ok(Json(serde_json::json!({
        "status": "success",
        "selected": req.context_ids,
    })))
}

async fn handle_clear_context(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    require_csrf(&state, &headers)?;
    state.context.clear_selection();
    Ok(Json(serde_json::json!({ "status": "success" })))
}

#[derive(Deserialize)]
pub struct AddSegmentRequest {
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub answer: String,
}

async fn handle_add_segment(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<AddSegmentRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, AppError> {
    require_csrf(&state, &headers)?;
    let Json(req) = body?;
    let id = state.context.add_qa_pair(&req.question, &req.answer).await?;
    Ok(Json(serde_json::json!({ "status": "success", "id": id })))
}

// ============ GET /health ============

fn health_label(ok: bool) -> String {
    if ok { "ok" } else { "unavailable" }.to_string()
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthReport> {
    let (llm_ok, store_ok) = tokio::join!(state.llm.health(), state.context.is_healthy());
    Json(HealthReport {
        status: if llm_ok && store_ok { "ok" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        dependencies: DependencyHealth {
            llm: health_label(llm_ok),
            context_store: health_label(store_ok),
        },
    })
}
