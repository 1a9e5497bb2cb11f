//! Context segments: stored question/answer pairs that can be selected to
//! bias generation toward a domain.
//!
//! [`ContextStore`] is the storage seam, with a SQLite implementation for
//! the server and an in-memory one for tests. [`ContextManager`] owns the
//! current selection and a TTL cache of query results on top of a store.
//!
//! The SQLite store ranks keyword matches with FTS5 `bm25()`. The in-memory
//! store scores whole-word overlap. There is no embedding index.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::config::ContextConfig;
use crate::models::{ContextSegment, SegmentSummary};

/// Maximum length of the description shown in segment listings.
const DESCRIPTION_CHARS: usize = 80;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("No segment IDs provided")]
    EmptySelection,

    #[error("Invalid segment ID format: {0}")]
    InvalidId(String),

    #[error("Question and answer are required")]
    MissingContent,

    #[error("context store failure: {0}")]
    Store(#[from] anyhow::Error),
}

/// A segment with its relevance to a query.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredSegment {
    pub segment: ContextSegment,
    pub score: f64,
}

#[async_trait]
pub trait ContextStore: Send + Sync {
    async fn insert(&self, segment: &ContextSegment) -> Result<()>;

    /// Returns the segments that exist among `ids`, in `ids` order.
    async fn get_many(&self, ids: &[String]) -> Result<Vec<ContextSegment>>;

    /// All segments, newest first.
    async fn list(&self) -> Result<Vec<ContextSegment>>;

    /// The `n` newest segments, newest first.
    async fn recent(&self, n: usize) -> Result<Vec<ContextSegment>>;

    /// Segments sharing at least one term with `query`, best first.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<ScoredSegment>>;

    async fn ping(&self) -> bool;
}

/// Fraction of query terms present as whole words, or `None` for no overlap.
fn term_score(terms: &[String], segment: &ContextSegment) -> Option<f64> {
    if terms.is_empty() {
        return None;
    }
    let words = query_terms(&format!("{} {}", segment.question, segment.content));
    let matches = terms.iter().filter(|t| words.contains(t)).count();
    if matches == 0 {
        None
    } else {
        Some(matches as f64 / terms.len() as f64)
    }
}

/// Lowercased alphanumeric words, without duplicates.
fn query_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for word in query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let word = word.to_lowercase();
        if !terms.contains(&word) {
            terms.push(word);
        }
    }
    terms
}

/// FTS5 expression matching any term. Terms are quoted so user input never
/// parses as query syntax.
fn fts_query(query: &str) -> Option<String> {
    let terms = query_terms(query);
    if terms.is_empty() {
        return None;
    }
    Some(
        terms
            .iter()
            .map(|t| format!("\"{}\"", t))
            .collect::<Vec<_>>()
            .join(" OR "),
    )
}

fn rank(segments: Vec<ContextSegment>, query: &str, limit: usize) -> Vec<ScoredSegment> {
    let terms = query_terms(query);
    let mut scored: Vec<ScoredSegment> = segments
        .into_iter()
        .filter_map(|segment| {
            term_score(&terms, &segment).map(|score| ScoredSegment { segment, score })
        })
        .collect();
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.segment.created_at.cmp(&a.segment.created_at))
    });
    scored.truncate(limit);
    scored
}

// ============ SQLite store ============

pub struct SqliteContextStore {
    pool: SqlitePool,
}

impl SqliteContextStore {
    /// Wraps a pool whose schema has already been migrated.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn row_to_segment(row: &sqlx::sqlite::SqliteRow) -> ContextSegment {
    ContextSegment {
        id: row.get("id"),
        question: row.get("question"),
        content: row.get("content"),
        created_at: row.get("created_at"),
    }
}

#[async_trait]
impl ContextStore for SqliteContextStore {
    async fn insert(&self, segment: &ContextSegment) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO segments (id, question, content, created_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET question = excluded.question, content = excluded.content",
        )
        .bind(&segment.id)
        .bind(&segment.question)
        .bind(&segment.content)
        .bind(segment.created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM segments_fts WHERE segment_id = ?")
            .bind(&segment.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO segments_fts (segment_id, question, content) VALUES (?, ?, ?)")
            .bind(&segment.id)
            .bind(&segment.question)
            .bind(&segment.content)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_many(&self, ids: &[String]) -> Result<Vec<ContextSegment>> {
        let mut found = Vec::with_capacity(ids.len());
        for id in ids {
            let row = sqlx::query("SELECT id, question, content, created_at FROM segments WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            if let Some(row) = row {
                found.push(row_to_segment(&row));
            }
        }
        Ok(found)
    }

    async fn list(&self) -> Result<Vec<ContextSegment>> {
        let rows = sqlx::query(
            "SELECT id, question, content, created_at FROM segments ORDER BY created_at DESC, rowid DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_segment).collect())
    }

    async fn recent(&self, n: usize) -> Result<Vec<ContextSegment>> {
        let rows = sqlx::query(
            "SELECT id, question, content, created_at FROM segments ORDER BY created_at DESC, rowid DESC LIMIT ?",
        )
        .bind(n as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_segment).collect())
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<ScoredSegment>> {
        let Some(expr) = fts_query(query) else {
            return Ok(Vec::new());
        };

        let rows = sqlx::query(
            r#"
            SELECT s.id, s.question, s.content, s.created_at, bm25(segments_fts) AS bm25_score
            FROM segments_fts
            JOIN segments s ON s.id = segments_fts.segment_id
            WHERE segments_fts MATCH ?
            ORDER BY bm25_score, s.created_at DESC
            LIMIT ?
            "#,
        )
        .bind(expr)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let bm25_score: f64 = row.get("bm25_score");
                ScoredSegment {
                    segment: row_to_segment(row),
                    score: -bm25_score, // bm25 is lower-is-better
                }
            })
            .collect())
    }

    async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}

// ============ In-memory store ============

/// Vector-backed store for tests. Insertion order breaks `created_at` ties.
#[derive(Default)]
pub struct InMemoryContextStore {
    segments: RwLock<Vec<ContextSegment>>,
}

impl InMemoryContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn newest_first(&self) -> Vec<ContextSegment> {
        let guard = self.segments.read().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<ContextSegment> = guard.iter().rev().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all
    }
}

#[async_trait]
impl ContextStore for InMemoryContextStore {
    async fn insert(&self, segment: &ContextSegment) -> Result<()> {
        let mut guard = self.segments.write().unwrap_or_else(|e| e.into_inner());
        guard.retain(|s| s.id != segment.id);
        guard.push(segment.clone());
        Ok(())
    }

    async fn get_many(&self, ids: &[String]) -> Result<Vec<ContextSegment>> {
        let guard = self.segments.read().unwrap_or_else(|e| e.into_inner());
        Ok(ids
            .iter()
            .filter_map(|id| guard.iter().find(|s| &s.id == id).cloned())
            .collect())
    }

    async fn list(&self) -> Result<Vec<ContextSegment>> {
        Ok(self.newest_first())
    }

    async fn recent(&self, n: usize) -> Result<Vec<ContextSegment>> {
        let mut all = self.newest_first();
        all.truncate(n);
        Ok(all)
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<ScoredSegment>> {
        Ok(rank(self.newest_first(), query, limit))
    }

    async fn ping(&self) -> bool {
        true
    }
}

// ============ Manager ============

pub fn is_valid_segment_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

type QueryCache = HashMap<(String, usize), (Instant, Vec<ScoredSegment>)>;

pub struct ContextManager {
    store: Arc<dyn ContextStore>,
    selected: RwLock<Vec<String>>,
    cache: Mutex<QueryCache>,
    cache_ttl: Duration,
    recent_pairs: usize,
}

impl ContextManager {
    pub fn new(store: Arc<dyn ContextStore>, config: &ContextConfig) -> Self {
        Self {
            store,
            selected: RwLock::new(Vec::new()),
            cache: Mutex::new(HashMap::new()),
            cache_ttl: Duration::from_secs(config.cache_ttl_secs),
            recent_pairs: config.recent_pairs,
        }
    }

    /// Stores an answered question as a new segment and returns its ID.
    pub async fn add_qa_pair(&self, question: &str, answer: &str) -> Result<String, ContextError> {
        if question.trim().is_empty() || answer.trim().is_empty() {
            return Err(ContextError::MissingContent);
        }
        let segment = ContextSegment {
            id: format!("qa_{}", uuid::Uuid::new_v4().simple()),
            question: question.trim().to_string(),
            content: answer.trim().to_string(),
            created_at: chrono::Utc::now().timestamp(),
        };
        self.store.insert(&segment).await?;
        self.invalidate_cache();
        tracing::debug!(id = %segment.id, "stored QA pair");
        Ok(segment.id)
    }

    pub async fn list_segments(&self) -> Result<Vec<SegmentSummary>, ContextError> {
        let selected = self.selected_ids();
        let segments = self.store.list().await?;
        Ok(segments
            .into_iter()
            .map(|s| SegmentSummary {
                active: selected.contains(&s.id),
                description: describe(&s),
                id: s.id,
            })
            .collect())
    }

    pub async fn segment_exists(&self, id: &str) -> Result<bool, ContextError> {
        let found = self.store.get_many(&[id.to_string()]).await?;
        Ok(!found.is_empty())
    }

    /// Replaces the selection. Returns `false`, leaving the selection
    /// untouched, if any ID does not exist.
    pub async fn select(&self, ids: &[String]) -> Result<bool, ContextError> {
        if ids.is_empty() {
            return Err(ContextError::EmptySelection);
        }
        if let Some(bad) = ids.iter().find(|id| !is_valid_segment_id(id)) {
            return Err(ContextError::InvalidId(bad.clone()));
        }

        let found = self.store.get_many(ids).await?;
        if found.len() != ids.len() {
            tracing::warn!(requested = ids.len(), found = found.len(), "some segment IDs were not found");
            return Ok(false);
        }

        let mut selected = self.selected.write().unwrap_or_else(|e| e.into_inner());
        *selected = ids.to_vec();
        tracing::info!(ids = ?ids, "selected context segments");
        Ok(true)
    }

    pub fn clear_selection(&self) {
        self.selected
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        tracing::info!("cleared context selection");
    }

    pub fn selected_ids(&self) -> Vec<String> {
        self.selected
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub async fn selected_context(&self) -> Result<Vec<ContextSegment>, ContextError> {
        let ids = self.selected_ids();
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.store.get_many(&ids).await?)
    }

    pub async fn recent_context(&self) -> Result<Vec<ContextSegment>, ContextError> {
        Ok(self.store.recent(self.recent_pairs).await?)
    }

    /// Ranked segments for `query`, served from cache while fresh.
    pub async fn query(&self, query: &str, limit: usize) -> Result<Vec<ScoredSegment>, ContextError> {
        let key = (query.to_string(), limit);
        {
            let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            let ttl = self.cache_ttl;
            cache.retain(|_, (at, _)| at.elapsed() < ttl);
            if let Some((_, hit)) = cache.get(&key) {
                return Ok(hit.clone());
            }
        }

        let results = self.store.search(query, limit).await?;
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, (Instant::now(), results.clone()));
        Ok(results)
    }

    /// Passages to prepend to a prompt: the selection when there is one,
    /// otherwise the most recent pairs. Oldest first.
    pub async fn context_for_prompt(&self) -> Result<Vec<String>, ContextError> {
        let mut segments = self.selected_context().await?;
        if segments.is_empty() {
            segments = self.recent_context().await?;
            segments.reverse();
        }
        Ok(segments
            .iter()
            .map(|s| format!("Q: {}\nA: {}", s.question, s.content))
            .collect())
    }

    pub async fn is_healthy(&self) -> bool {
        self.store.ping().await
    }

    fn invalidate_cache(&self) {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

fn describe(segment: &ContextSegment) -> String {
    let mut desc: String = segment.question.chars().take(DESCRIPTION_CHARS).collect();
    if segment.question.chars().count() > DESCRIPTION_CHARS {
        desc.push('…');
    }
    desc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ContextManager {
        ContextManager::new(Arc::new(InMemoryContextStore::new()), &ContextConfig::default())
    }

    #[tokio::test]
    async fn test_add_and_list() {
        let mgr = manager();
        let id = mgr.add_qa_pair("What is Rust?", "A systems language.").await.unwrap();
        assert!(id.starts_with("qa_"));
        assert!(is_valid_segment_id(&id));

        let list = mgr.list_segments().await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].description, "What is Rust?");
        assert!(!list[0].active);
        assert!(mgr.segment_exists(&id).await.unwrap());
        assert!(!mgr.segment_exists("qa_missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_add_requires_content() {
        let mgr = manager();
        assert!(matches!(
            mgr.add_qa_pair("  ", "x").await,
            Err(ContextError::MissingContent)
        ));
    }

    #[tokio::test]
    async fn test_select_marks_active() {
        let mgr = manager();
        let a = mgr.add_qa_pair("alpha?", "one").await.unwrap();
        let _b = mgr.add_qa_pair("beta?", "two").await.unwrap();

        assert!(mgr.select(&[a.clone()]).await.unwrap());
        let list = mgr.list_segments().await.unwrap();
        let active: Vec<_> = list.iter().filter(|s| s.active).map(|s| s.id.clone()).collect();
        assert_eq!(active, vec![a]);
    }

    #[tokio::test]
    async fn test_select_unknown_id_keeps_selection() {
        let mgr = manager();
        let a = mgr.add_qa_pair("alpha?", "one").await.unwrap();
        assert!(mgr.select(&[a.clone()]).await.unwrap());
        assert!(!mgr.select(&[a.clone(), "missing".to_string()]).await.unwrap());
        assert_eq!(mgr.selected_ids(), vec![a]);
    }

    #[tokio::test]
    async fn test_select_rejects_bad_input() {
        let mgr = manager();
        assert!(matches!(mgr.select(&[]).await, Err(ContextError::EmptySelection)));
        assert!(matches!(
            mgr.select(&["../etc".to_string()]).await,
            Err(ContextError::InvalidId(_))
        ));
    }

    #[tokio::test]
    async fn test_context_prefers_selection_then_recent() {
        let mgr = manager();
        let a = mgr.add_qa_pair("first?", "1").await.unwrap();
        mgr.add_qa_pair("second?", "2").await.unwrap();
        mgr.add_qa_pair("third?", "3").await.unwrap();

        // Default: two most recent, oldest first.
        let ctx = mgr.context_for_prompt().await.unwrap();
        assert_eq!(ctx, vec!["Q: second?\nA: 2", "Q: third?\nA: 3"]);

        mgr.select(&[a]).await.unwrap();
        let ctx = mgr.context_for_prompt().await.unwrap();
        assert_eq!(ctx, vec!["Q: first?\nA: 1"]);

        mgr.clear_selection();
        assert!(mgr.selected_ids().is_empty());
    }

    #[tokio::test]
    async fn test_query_ranks_by_overlap() {
        let mgr = manager();
        mgr.add_qa_pair("deploy to kubernetes", "use helm").await.unwrap();
        mgr.add_qa_pair("kubernetes basics", "pods and services").await.unwrap();
        mgr.add_qa_pair("cooking pasta", "boil water").await.unwrap();

        let hits = mgr.query("helm kubernetes", 5).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].segment.question, "deploy to kubernetes");
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn test_query_cache_invalidated_on_insert() {
        let mgr = manager();
        assert!(mgr.query("rust", 5).await.unwrap().is_empty());
        mgr.add_qa_pair("rust?", "yes").await.unwrap();
        assert_eq!(mgr.query("rust", 5).await.unwrap().len(), 1);
    }

    async fn sqlite_store(dir: &tempfile::TempDir) -> SqliteContextStore {
        let mut config = crate::config::Config::default();
        config.db.path = dir.path().join("ctx.sqlite");
        let pool = crate::db::connect(&config).await.unwrap();
        crate::migrate::apply(&pool).await.unwrap();
        SqliteContextStore::new(pool)
    }

    fn segment(id: &str, question: &str, content: &str, created_at: i64) -> ContextSegment {
        ContextSegment {
            id: id.to_string(),
            question: question.to_string(),
            content: content.to_string(),
            created_at,
        }
    }

    #[tokio::test]
    async fn test_sqlite_search_ranks_with_fts() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = sqlite_store(&dir).await;
        store
            .insert(&segment("qa_deploy", "How do I deploy?", "Run the deploy script on the staging cluster.", 1))
            .await
            .unwrap();
        store
            .insert(&segment("qa_staging", "Where is staging?", "In the second region.", 2))
            .await
            .unwrap();
        store
            .insert(&segment("qa_color", "Favorite color?", "Teal, and a calm one.", 3))
            .await
            .unwrap();

        let hits = store.search("deploy staging", 5).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.segment.id.as_str()).collect();
        assert_eq!(ids, vec!["qa_deploy", "qa_staging"]);
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn test_sqlite_search_matches_whole_words_only() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = sqlite_store(&dir).await;
        store
            .insert(&segment("qa_one", "What tone?", "Warm and direct.", 1))
            .await
            .unwrap();

        assert!(store.search("a", 5).await.unwrap().is_empty());
        assert!(store.search("   ", 5).await.unwrap().is_empty());
        // Query syntax characters are treated as plain text.
        let hits = store.search("tone\" OR NEAR(*", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn test_sqlite_reinsert_replaces_index_entry() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = sqlite_store(&dir).await;
        store.insert(&segment("qa_x", "old question", "old answer", 1)).await.unwrap();
        store.insert(&segment("qa_x", "new question", "new answer", 1)).await.unwrap();

        assert!(store.search("old", 5).await.unwrap().is_empty());
        let hits = store.search("new", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].segment.content, "new answer");
    }

    #[tokio::test]
    async fn test_migration_backfills_keyword_index() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = sqlite_store(&dir).await;
        store.insert(&segment("qa_old", "legacy row", "from before", 1)).await.unwrap();
        sqlx::query("DROP TABLE segments_fts").execute(&store.pool).await.unwrap();

        crate::migrate::apply(&store.pool).await.unwrap();
        crate::migrate::apply(&store.pool).await.unwrap();
        assert_eq!(store.search("legacy", 5).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_memory_search_matches_whole_words_only() {
        let mgr = manager();
        mgr.add_qa_pair("What tone?", "Warm and direct.").await.unwrap();
        assert!(mgr.query("a", 5).await.unwrap().is_empty());
        assert_eq!(mgr.query("TONE", 5).await.unwrap().len(), 1);
    }

    #[test]
    fn test_description_truncated() {
        let seg = ContextSegment {
            id: "x".to_string(),
            question: "q".repeat(100),
            content: String::new(),
            created_at: 0,
        };
        let desc = describe(&seg);
        assert_eq!(desc.chars().count(), DESCRIPTION_CHARS + 1);
        assert!(desc.ends_with('…'));
    }
}
