//! # Text Humanizer
//!
//! Rewrites machine-sounding text into natural phrasing using an
//! OpenAI-compatible LLM endpoint, optionally conditioned on stored
//! question/answer context.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  POST /process   ┌──────────────┐   chat/completions   ┌─────────┐
//! │ Chat client  │─────────────────▶│    Server    │─────────────────────▶│   LLM   │
//! │ (terminal)   │◀── event stream ─│   (axum)     │◀──── SSE deltas ─────│         │
//! └──────┬───────┘                  └──────┬───────┘                      └─────────┘
//!        │                                 │
//!        ▼                                 ▼
//!  chatHistory.json                 SQLite segments
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration with environment overlays |
//! | [`models`] | Core data types |
//! | [`error`] | Validation, transport and persistence errors |
//! | [`validation`] | Length, character and rate-limit checks |
//! | [`client`] | Chat client: transport, persistence, rendering, controller |
//! | [`server`] | HTTP routes |
//! | [`llm`] | LLM provider with retry and model fallback |
//! | [`context`] | Context segments and selection |
//! | [`input`] | Server-side input processing |
//! | [`chips`] | Inline `@command{...}` handling |
//! | [`csrf`] | CSRF token issue and verification |
//! | [`commands`] | CLI command runners |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod chips;
pub mod client;
pub mod commands;
pub mod config;
pub mod context;
pub mod csrf;
pub mod db;
pub mod error;
pub mod input;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod server;
pub mod validation;
