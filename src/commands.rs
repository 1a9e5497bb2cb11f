//! CLI command runners.
//!
//! `context add|list|search` work on the database directly. The selection
//! is held by a running server, so `context select|clear` and the
//! `chat`, `humanize` and `health` commands talk to `[client].server_url`.

use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;

use crate::client::{
    ChatEvent, ChatSession, FileStorage, HttpTransport, PersistenceManager, TerminalRenderer,
};
use crate::config::Config;
use crate::context::{ContextManager, SqliteContextStore};
use crate::db;
use crate::validation::{SystemClock, Validator};

async fn connect_server(config: &Config) -> Result<HttpTransport> {
    HttpTransport::connect(&config.client.server_url)
        .await
        .with_context(|| format!("could not reach server at {}", config.client.server_url))
}

async fn open_context(config: &Config) -> Result<(ContextManager, sqlx::SqlitePool)> {
    let pool = db::connect(config).await?;
    let store = Arc::new(SqliteContextStore::new(pool.clone()));
    Ok((ContextManager::new(store, &config.context), pool))
}

/// Interactive chat on stdin/stdout. `/quit` or end of input exits once the
/// pending reply has arrived.
pub async fn run_chat(config: &Config) -> Result<()> {
    let transport = connect_server(config).await?;
    let storage = Arc::new(FileStorage::new(&config.client.state_dir));

    let session = ChatSession::new(
        Validator::from_config(&config.client.validation),
        Arc::new(SystemClock),
        PersistenceManager::new(storage),
        TerminalRenderer::stdout(),
        Arc::new(transport),
    );
    let events = session.sender();

    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim() == "/quit" => break,
                Ok(Some(line)) => {
                    if events.send(ChatEvent::Input(line)).is_err()
                        || events.send(ChatEvent::Submit).is_err()
                    {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "stdin read failed");
                    break;
                }
            }
        }
        let _ = events.send(ChatEvent::Shutdown);
    });

    session.run().await;
    println!();
    Ok(())
}

pub async fn run_humanize(config: &Config, text: &str, style: Option<&str>) -> Result<()> {
    let transport = connect_server(config).await?;
    let result = transport.humanize(text, style).await?;

    println!("{}", result.humanized_text);
    println!();
    println!("confidence: {:.2}", result.confidence_score);
    if let Some(tone) = &result.tone {
        println!("tone:       {}", tone);
    }
    if !result.changes_made.is_empty() {
        println!("changes:");
        for change in &result.changes_made {
            println!("  - {}", change);
        }
    }
    Ok(())
}

pub async fn run_context_add(config: &Config, question: &str, answer: &str) -> Result<()> {
    let (manager, pool) = open_context(config).await?;
    let id = manager.add_qa_pair(question, answer).await;
    pool.close().await;
    println!("Added segment {}", id?);
    Ok(())
}

pub async fn run_context_list(config: &Config) -> Result<()> {
    let (manager, pool) = open_context(config).await?;
    let segments = manager.list_segments().await;
    pool.close().await;
    let segments = segments?;

    if segments.is_empty() {
        println!("No context segments.");
        return Ok(());
    }
    for segment in &segments {
        println!("{}  {}", segment.id, segment.description);
    }
    println!();
    println!("{} segment(s)", segments.len());
    Ok(())
}

pub async fn run_context_search(config: &Config, query: &str, limit: usize) -> Result<()> {
    let (manager, pool) = open_context(config).await?;
    let results = manager.query(query, limit).await;
    pool.close().await;
    let results = results?;

    if results.is_empty() {
        println!("No matching segments.");
        return Ok(());
    }
    for (i, hit) in results.iter().enumerate() {
        println!(
            "{}. [{:.2}] {}  Q: {}",
            i + 1,
            hit.score,
            hit.segment.id,
            hit.segment.question
        );
    }
    Ok(())
}

pub async fn run_context_select(config: &Config, ids: &[String]) -> Result<()> {
    let transport = connect_server(config).await?;
    transport.select_context(ids).await?;
    println!("Selected {} segment(s).", ids.len());
    Ok(())
}

pub async fn run_context_clear(config: &Config) -> Result<()> {
    let transport = connect_server(config).await?;
    transport.clear_context().await?;
    println!("Context selection cleared.");
    Ok(())
}

pub async fn run_health(config: &Config) -> Result<()> {
    let transport = connect_server(config).await?;
    let report = transport.health().await?;

    println!("status:        {}", report.status);
    println!("version:       {}", report.version);
    println!("llm:           {}", report.dependencies.llm);
    println!("context_store: {}", report.dependencies.context_store);
    if report.status != "ok" {
        bail!("server reported {}", report.status);
    }
    Ok(())
}
