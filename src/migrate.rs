use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Creates the schema on a fresh connection and closes it. Idempotent.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Applies the schema to an existing pool.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Question/answer pairs usable as context segments
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS segments (
            id TEXT PRIMARY KEY,
            question TEXT NOT NULL,
            content TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_segments_created_at ON segments(created_at DESC)")
        .execute(pool)
        .await?;

    // Keyword index over segments, backfilled from existing rows on creation.
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='segments_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE segments_fts USING fts5(
                segment_id UNINDEXED,
                question,
                content
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "INSERT INTO segments_fts (segment_id, question, content) SELECT id, question, content FROM segments",
        )
        .execute(pool)
        .await?;
    }

    Ok(())
}
