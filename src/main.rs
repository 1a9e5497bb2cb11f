//! # Humanizer CLI (`humanizer`)
//!
//! Runs the humanizer server, the terminal chat client, and a handful of
//! maintenance commands.
//!
//! ## Usage
//!
//! ```bash
//! humanizer --config ./config/humanizer.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `humanizer init` | Create the SQLite database and run schema migrations |
//! | `humanizer serve` | Start the HTTP server |
//! | `humanizer chat` | Interactive chat against a running server |
//! | `humanizer humanize "<text>"` | One-shot rewrite via `POST /api/humanize` |
//! | `humanizer context add` | Store a question/answer pair |
//! | `humanizer context list` | List stored segments |
//! | `humanizer context search "<query>"` | Rank segments against a query |
//! | `humanizer context select <ids..>` | Select segments on the running server |
//! | `humanizer context clear` | Clear the server's selection |
//! | `humanizer health` | Show server and dependency health |
//!
//! ## Environments
//!
//! Setting `APP_ENV=production` merges `humanizer.production.toml` from the
//! config file's directory over the base file.
//!
//! ## Logging
//!
//! `[logging] level` sets the default filter; `RUST_LOG` overrides it.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use text_humanizer::{commands, config, migrate, server};

/// Text Humanizer: rewrites text into natural phrasing with a local LLM.
#[derive(Parser)]
#[command(name = "humanizer", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/humanizer.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent: running it again leaves existing segments in place.
    Init,

    /// Start the HTTP server on `[server].bind`.
    Serve,

    /// Chat with the server from the terminal.
    ///
    /// Each line is one message. `/quit` or end of input exits.
    Chat,

    /// Rewrite a single piece of text.
    Humanize {
        text: String,

        /// Tone or style directive, e.g. `casual` or `formal`.
        #[arg(long)]
        style: Option<String>,
    },

    /// Manage context segments.
    Context {
        #[command(subcommand)]
        action: ContextAction,
    },

    /// Check the running server.
    Health,
}

#[derive(Subcommand)]
enum ContextAction {
    /// Store a question/answer pair as a new segment.
    Add {
        #[arg(long)]
        question: String,
        #[arg(long)]
        answer: String,
    },
    /// List stored segments.
    List,
    /// Rank stored segments against a query.
    Search {
        query: String,
        #[arg(long, default_value = "5")]
        limit: usize,
    },
    /// Select segments to use as context on the running server.
    Select {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Clear the running server's selection.
    Clear,
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    init_tracing(&cfg.logging.level);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Chat => {
            commands::run_chat(&cfg).await?;
        }
        Commands::Humanize { text, style } => {
            commands::run_humanize(&cfg, &text, style.as_deref()).await?;
        }
        Commands::Context { action } => match action {
            ContextAction::Add { question, answer } => {
                commands::run_context_add(&cfg, &question, &answer).await?;
            }
            ContextAction::List => {
                commands::run_context_list(&cfg).await?;
            }
            ContextAction::Search { query, limit } => {
                commands::run_context_search(&cfg, &query, limit).await?;
            }
            ContextAction::Select { ids } => {
                commands::run_context_select(&cfg, &ids).await?;
            }
            ContextAction::Clear => {
                commands::run_context_clear(&cfg).await?;
            }
        },
        Commands::Health => {
            commands::run_health(&cfg).await?;
        }
    }

    Ok(())
}
