//! TOML configuration.
//!
//! A base file (default `./config/humanizer.toml`) is read first. When the
//! `APP_ENV` environment variable is set, a sibling overlay named
//! `<stem>.<env>.toml` is merged over it table by table, so an overlay only
//! needs the keys it changes:
//!
//! ```text
//! config/humanizer.toml             # base
//! config/humanizer.production.toml  # APP_ENV=production
//! ```
//!
//! Every section has defaults, so an empty base file is a valid config.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable that selects the overlay file.
pub const ENV_VAR: &str = "APP_ENV";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub input: InputConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Key for CSRF token signing. A random key is generated at startup when unset,
    /// which invalidates outstanding tokens on every restart.
    #[serde(default)]
    pub csrf_secret: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            csrf_secret: None,
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:5000".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/humanizer.sqlite")
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_endpoint_url")]
    pub endpoint_url: String,
    /// Model used for conversational replies (`/process`).
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
    /// Model used for structured rewrites (`/api/humanize`, `@humanize` chips).
    #[serde(default = "default_humanize_model")]
    pub humanize_model: String,
    /// Tried in order once retries against the primary model are exhausted.
    #[serde(default = "default_fallback_models")]
    pub fallback_models: Vec<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_humanize_temperature")]
    pub humanize_temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Name of the environment variable holding a bearer token, if the endpoint needs one.
    #[serde(default)]
    pub api_key_env: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint_url: default_endpoint_url(),
            chat_model: default_chat_model(),
            humanize_model: default_humanize_model(),
            fallback_models: default_fallback_models(),
            temperature: default_temperature(),
            humanize_temperature: default_humanize_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            api_key_env: None,
        }
    }
}

fn default_endpoint_url() -> String {
    "http://localhost:1234".to_string()
}
fn default_chat_model() -> String {
    "mistral-nemo-instruct-2407".to_string()
}
fn default_humanize_model() -> String {
    "internlm2_5-20b-chat".to_string()
}
fn default_fallback_models() -> Vec<String> {
    vec![
        "qwen2.5-14b-instruct".to_string(),
        "mistral-nemo-instruct-2407".to_string(),
    ]
}
fn default_temperature() -> f32 {
    0.7
}
fn default_humanize_temperature() -> f32 {
    0.3
}
fn default_max_tokens() -> u32 {
    2048
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    1000
}

/// Server-side input limits applied by the input processor.
#[derive(Debug, Deserialize, Clone)]
pub struct InputConfig {
    #[serde(default = "default_input_min")]
    pub min_length: usize,
    #[serde(default = "default_input_max")]
    pub max_length: usize,
    #[serde(default = "default_max_requests")]
    pub max_requests: usize,
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            min_length: default_input_min(),
            max_length: default_input_max(),
            max_requests: default_max_requests(),
            window_seconds: default_window_seconds(),
        }
    }
}

fn default_input_min() -> usize {
    1
}
fn default_input_max() -> usize {
    2000
}
fn default_max_requests() -> usize {
    10
}
fn default_window_seconds() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct ContextConfig {
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Number of recent question/answer pairs merged into every prompt.
    #[serde(default = "default_recent_pairs")]
    pub recent_pairs: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl_secs(),
            recent_pairs: default_recent_pairs(),
        }
    }
}

fn default_cache_ttl_secs() -> u64 {
    300
}
fn default_recent_pairs() -> usize {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClientConfig {
    #[serde(default = "default_server_url")]
    pub server_url: String,
    /// Directory backing the client's key/value storage (chat transcript).
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default)]
    pub validation: ValidationConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            state_dir: default_state_dir(),
            validation: ValidationConfig::default(),
        }
    }
}

fn default_server_url() -> String {
    "http://127.0.0.1:5000".to_string()
}
fn default_state_dir() -> PathBuf {
    PathBuf::from("./data/client")
}

/// Client-side validation limits checked before anything is sent.
#[derive(Debug, Deserialize, Clone)]
pub struct ValidationConfig {
    #[serde(default = "default_client_min")]
    pub min_length: usize,
    #[serde(default = "default_client_max")]
    pub max_length: usize,
    #[serde(default = "default_max_requests")]
    pub max_requests: usize,
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            min_length: default_client_min(),
            max_length: default_client_max(),
            max_requests: default_max_requests(),
            window_seconds: default_window_seconds(),
        }
    }
}

fn default_client_min() -> usize {
    2
}
fn default_client_max() -> usize {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Loads the base config and, if `APP_ENV` is set, merges its overlay.
pub fn load_config(path: &Path) -> Result<Config> {
    let env = std::env::var(ENV_VAR).ok();
    load_config_for_env(path, env.as_deref())
}

/// Loads the base config and the overlay for `env`, when present.
///
/// A missing overlay is not an error; a missing base file is.
pub fn load_config_for_env(path: &Path, env: Option<&str>) -> Result<Config> {
    let mut value = read_toml(path)?;

    if let Some(env) = env.filter(|e| !e.is_empty()) {
        let overlay_path = overlay_path(path, env);
        if overlay_path.exists() {
            let overlay = read_toml(&overlay_path)?;
            merge_tables(&mut value, overlay);
            tracing::debug!(overlay = %overlay_path.display(), "merged environment overlay");
        } else {
            tracing::debug!(overlay = %overlay_path.display(), "no overlay for environment");
        }
    }

    let config = value
        .try_into::<Config>()
        .with_context(|| "Failed to parse config file")?;

    validate(&config)?;
    Ok(config)
}

fn read_toml(path: &Path) -> Result<toml::Value> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

/// `config/humanizer.toml` + `production` → `config/humanizer.production.toml`.
fn overlay_path(path: &Path, env: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "humanizer".to_string());
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_string())
        .unwrap_or_else(|| "toml".to_string());
    path.with_file_name(format!("{}.{}.{}", stem, env, ext))
}

/// Recursively merges `overlay` into `base`. Tables merge key by key;
/// any other value in the overlay replaces the base value.
fn merge_tables(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, value) in overlay_table {
                match base_table.get_mut(&key) {
                    Some(existing) => merge_tables(existing, value),
                    None => {
                        base_table.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn validate(config: &Config) -> Result<()> {
    let v = &config.client.validation;
    if v.min_length > v.max_length {
        bail!("client.validation.min_length must be <= max_length");
    }
    if v.max_requests == 0 || v.window_seconds == 0 {
        bail!("client.validation.max_requests and window_seconds must be > 0");
    }

    let i = &config.input;
    if i.min_length > i.max_length {
        bail!("input.min_length must be <= max_length");
    }
    if i.max_requests == 0 || i.window_seconds == 0 {
        bail!("input.max_requests and window_seconds must be > 0");
    }

    if config.llm.endpoint_url.trim().is_empty() {
        bail!("llm.endpoint_url must not be empty");
    }
    if !(0.0..=2.0).contains(&config.llm.temperature)
        || !(0.0..=2.0).contains(&config.llm.humanize_temperature)
    {
        bail!("llm temperatures must be in [0.0, 2.0]");
    }

    Ok(())
}
