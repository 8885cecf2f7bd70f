//! SQLite-backed implementation of every storage trait.
//!
//! Concurrency guarantees come from single statements rather than
//! application locks:
//!
//! - the cache upsert is one `INSERT … ON CONFLICT … DO UPDATE … RETURNING`;
//! - session mutation is optimistic compare-and-swap on `version`;
//! - turn appends compute the clamped `sent_at` inside the `INSERT`.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use tutor_rag_core::embedding::{blob_to_vec, vec_to_blob};
use tutor_rag_core::models::{
    ChatSession, Chunk, ChunkRef, ConversationTurn, EditorContext, EmbeddingCacheEntry, Metadata,
    SourceSummary, TurnRole,
};
use tutor_rag_core::store::{
    ChunkStore, EmbeddingCacheStore, SessionMutation, SessionStore, TurnStore,
};

/// Upper bound on compare-and-swap rounds for one session update.
const MAX_CAS_ATTEMPTS: u32 = 64;

const CHUNK_COLUMNS: &str = "id, source_id, document_type, raw_content, chunk_text, chunk_index, \
     metadata_json, embedding, embedding_dimensions, embedding_model, created_at";

const SESSION_COLUMNS: &str = "session_id, user_id, attempt_count, max_attempts, is_blocked, \
     blocked_until, last_activity, created_at, progress_json, version";

const TURN_COLUMNS: &str = "seq, turn_id, session_id, role, content, sent_at, editor_json, \
     chunk_refs_json, token_count";

/// SQLite implementation of the store traits.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn parse_map(json: &str) -> Metadata {
    serde_json::from_str(json).unwrap_or_default()
}

fn chunk_from_row(row: &SqliteRow) -> Result<Chunk> {
    let blob: Vec<u8> = row.try_get("embedding")?;
    let metadata_json: String = row.try_get("metadata_json")?;
    let dims: i64 = row.try_get("embedding_dimensions")?;
    Ok(Chunk {
        id: row.try_get("id")?,
        source_id: row.try_get("source_id")?,
        document_type: row.try_get("document_type")?,
        raw_content: row.try_get("raw_content")?,
        chunk_text: row.try_get("chunk_text")?,
        chunk_index: row.try_get("chunk_index")?,
        metadata: parse_map(&metadata_json),
        embedding: blob_to_vec(&blob),
        embedding_dimensions: dims.max(0) as usize,
        embedding_model: row.try_get("embedding_model")?,
        created_at: from_millis(row.try_get("created_at")?),
    })
}

fn cache_entry_from_row(row: &SqliteRow) -> Result<EmbeddingCacheEntry> {
    let blob: Vec<u8> = row.try_get("vector")?;
    let dims: i64 = row.try_get("dimensions")?;
    Ok(EmbeddingCacheEntry {
        text_hash: row.try_get("text_hash")?,
        model: row.try_get("model")?,
        vector: blob_to_vec(&blob),
        dimensions: dims.max(0) as usize,
        usage_count: row.try_get("usage_count")?,
        last_used_at: from_millis(row.try_get("last_used_at")?),
        created_at: from_millis(row.try_get("created_at")?),
    })
}

fn session_from_row(row: &SqliteRow) -> Result<ChatSession> {
    let progress_json: String = row.try_get("progress_json")?;
    let blocked_until: Option<i64> = row.try_get("blocked_until")?;
    Ok(ChatSession {
        session_id: row.try_get("session_id")?,
        user_id: row.try_get("user_id")?,
        attempt_count: row.try_get("attempt_count")?,
        max_attempts: row.try_get("max_attempts")?,
        is_blocked: row.try_get("is_blocked")?,
        blocked_until: blocked_until.map(from_millis),
        last_activity: from_millis(row.try_get("last_activity")?),
        created_at: from_millis(row.try_get("created_at")?),
        progress_data: parse_map(&progress_json),
        version: row.try_get("version")?,
    })
}

fn turn_from_row(row: &SqliteRow) -> Result<ConversationTurn> {
    let role: String = row.try_get("role")?;
    let editor_json: Option<String> = row.try_get("editor_json")?;
    let refs_json: Option<String> = row.try_get("chunk_refs_json")?;
    Ok(ConversationTurn {
        seq: row.try_get("seq")?,
        turn_id: row.try_get("turn_id")?,
        session_id: row.try_get("session_id")?,
        role: TurnRole::parse(&role).with_context(|| format!("unknown turn role '{}'", role))?,
        content: row.try_get("content")?,
        sent_at: from_millis(row.try_get("sent_at")?),
        editor_context: editor_json
            .as_deref()
            .map(serde_json::from_str::<EditorContext>)
            .transpose()?,
        retrieved_chunks: refs_json
            .as_deref()
            .map(serde_json::from_str::<Vec<ChunkRef>>)
            .transpose()?,
        token_count: row.try_get("token_count")?,
    })
}

#[async_trait]
impl ChunkStore for SqliteStore {
    async fn insert_chunk(&self, chunk: &Chunk) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO chunks (id, source_id, document_type, raw_content, chunk_text,
                                chunk_index, metadata_json, embedding, embedding_dimensions,
                                embedding_model, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&chunk.id)
        .bind(&chunk.source_id)
        .bind(&chunk.document_type)
        .bind(&chunk.raw_content)
        .bind(&chunk.chunk_text)
        .bind(chunk.chunk_index)
        .bind(serde_json::to_string(&chunk.metadata)?)
        .bind(vec_to_blob(&chunk.embedding))
        .bind(chunk.embedding_dimensions as i64)
        .bind(&chunk.embedding_model)
        .bind(to_millis(chunk.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn chunks(&self, doc_type: Option<&str>) -> Result<Vec<Chunk>> {
        let sql = format!(
            "SELECT {} FROM chunks WHERE (?1 IS NULL OR document_type = ?1) ORDER BY seq ASC",
            CHUNK_COLUMNS
        );
        let rows = sqlx::query(&sql).bind(doc_type).fetch_all(&self.pool).await?;
        rows.iter().map(chunk_from_row).collect()
    }

    async fn has_source(&self, source_id: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM chunks WHERE source_id = ?)")
            .bind(source_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn chunk_count(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    async fn clear_chunks(&self) -> Result<usize> {
        let result = sqlx::query("DELETE FROM chunks").execute(&self.pool).await?;
        Ok(result.rows_affected() as usize)
    }

    async fn list_sources(&self) -> Result<Vec<SourceSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT source_id, MIN(document_type) AS document_type, COUNT(*) AS chunks
            FROM chunks
            GROUP BY source_id
            ORDER BY source_id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let chunks: i64 = row.try_get("chunks")?;
                Ok(SourceSummary {
                    source_id: row.try_get("source_id")?,
                    document_type: row.try_get("document_type")?,
                    chunks: chunks as usize,
                })
            })
            .collect()
    }
}

#[async_trait]
impl EmbeddingCacheStore for SqliteStore {
    async fn touch(
        &self,
        text_hash: &str,
        model: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<EmbeddingCacheEntry>> {
        let row = sqlx::query(
            r#"
            UPDATE embedding_cache
            SET usage_count = usage_count + 1, last_used_at = ?
            WHERE text_hash = ? AND model = ?
            RETURNING text_hash, model, vector, dimensions, usage_count, last_used_at, created_at
            "#,
        )
        .bind(to_millis(now))
        .bind(text_hash)
        .bind(model)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(cache_entry_from_row).transpose()
    }

    async fn record(
        &self,
        text_hash: &str,
        model: &str,
        vector: &[f32],
        now: DateTime<Utc>,
    ) -> Result<EmbeddingCacheEntry> {
        let row = sqlx::query(
            r#"
            INSERT INTO embedding_cache (text_hash, model, vector, dimensions, usage_count,
                                         last_used_at, created_at)
            VALUES (?, ?, ?, ?, 1, ?, ?)
            ON CONFLICT(text_hash, model) DO UPDATE SET
                usage_count = usage_count + 1,
                last_used_at = excluded.last_used_at
            RETURNING text_hash, model, vector, dimensions, usage_count, last_used_at, created_at
            "#,
        )
        .bind(text_hash)
        .bind(model)
        .bind(vec_to_blob(vector))
        .bind(vector.len() as i64)
        .bind(to_millis(now))
        .bind(to_millis(now))
        .fetch_one(&self.pool)
        .await?;

        cache_entry_from_row(&row)
    }

    async fn cache_entry(&self, text_hash: &str, model: &str) -> Result<Option<EmbeddingCacheEntry>> {
        let row = sqlx::query(
            r#"
            SELECT text_hash, model, vector, dimensions, usage_count, last_used_at, created_at
            FROM embedding_cache
            WHERE text_hash = ? AND model = ?
            "#,
        )
        .bind(text_hash)
        .bind(model)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(cache_entry_from_row).transpose()
    }

    async fn evict_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let result = sqlx::query("DELETE FROM embedding_cache WHERE last_used_at < ?")
            .bind(to_millis(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn cache_len(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM embedding_cache")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn get_or_create(
        &self,
        session_id: &str,
        user_id: Option<&str>,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<ChatSession> {
        let fresh = ChatSession::new(session_id, user_id, max_attempts, now);
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO chat_sessions (session_id, user_id, attempt_count, max_attempts,
                                                 is_blocked, blocked_until, last_activity,
                                                 created_at, progress_json, version)
            VALUES (?, ?, 0, ?, 0, NULL, ?, ?, '{}', 0)
            "#,
        )
        .bind(&fresh.session_id)
        .bind(&fresh.user_id)
        .bind(fresh.max_attempts)
        .bind(to_millis(now))
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;

        self.get_session(session_id)
            .await?
            .with_context(|| format!("session {} vanished after insert", session_id))
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<ChatSession>> {
        let sql = format!("SELECT {} FROM chat_sessions WHERE session_id = ?", SESSION_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn update_session(&self, session_id: &str, mutate: SessionMutation<'_>) -> Result<ChatSession> {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let Some(current) = self.get_session(session_id).await? else {
                bail!("session not found: {}", session_id);
            };
            let mut next = current.clone();
            mutate(&mut next);
            next.version = current.version + 1;

            let result = sqlx::query(
                r#"
                UPDATE chat_sessions
                SET user_id = ?, attempt_count = ?, max_attempts = ?, is_blocked = ?,
                    blocked_until = ?, last_activity = ?, progress_json = ?, version = ?
                WHERE session_id = ? AND version = ?
                "#,
            )
            .bind(&next.user_id)
            .bind(next.attempt_count)
            .bind(next.max_attempts)
            .bind(next.is_blocked)
            .bind(next.blocked_until.map(to_millis))
            .bind(to_millis(next.last_activity))
            .bind(serde_json::to_string(&next.progress_data)?)
            .bind(next.version)
            .bind(session_id)
            .bind(current.version)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 1 {
                return Ok(next);
            }
            debug!(session_id, attempt, "session version moved; retrying update");
            tokio::task::yield_now().await;
        }
        bail!(
            "session {} kept changing; gave up after {} update attempts",
            session_id,
            MAX_CAS_ATTEMPTS
        )
    }
}

impl SqliteStore {
    async fn window(&self, session_id: &str, limit: i64) -> Result<Vec<ConversationTurn>> {
        // Negative LIMIT means no limit in SQLite.
        let sql = format!(
            "SELECT {cols} FROM (SELECT {cols} FROM conversation_turns WHERE session_id = ? \
             ORDER BY sent_at DESC, seq DESC LIMIT ?) ORDER BY sent_at ASC, seq ASC",
            cols = TURN_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(session_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(turn_from_row).collect()
    }
}

#[async_trait]
impl TurnStore for SqliteStore {
    async fn append_turn(&self, turn: &ConversationTurn) -> Result<ConversationTurn> {
        let editor_json = turn.editor_context.as_ref().map(serde_json::to_string).transpose()?;
        let refs_json = turn.retrieved_chunks.as_ref().map(serde_json::to_string).transpose()?;

        let row = sqlx::query(
            r#"
            INSERT INTO conversation_turns (turn_id, session_id, role, content, sent_at,
                                            editor_json, chunk_refs_json, token_count)
            VALUES (?1, ?2, ?3, ?4,
                    MAX(?5, COALESCE((SELECT MAX(sent_at) FROM conversation_turns
                                      WHERE session_id = ?2), ?5)),
                    ?6, ?7, ?8)
            RETURNING seq, sent_at
            "#,
        )
        .bind(&turn.turn_id)
        .bind(&turn.session_id)
        .bind(turn.role.as_str())
        .bind(&turn.content)
        .bind(to_millis(turn.sent_at))
        .bind(editor_json)
        .bind(refs_json)
        .bind(turn.token_count)
        .fetch_one(&self.pool)
        .await?;

        let mut stored = turn.clone();
        stored.seq = row.try_get("seq")?;
        stored.sent_at = from_millis(row.try_get("sent_at")?);
        Ok(stored)
    }

    async fn recent_turns(&self, session_id: &str, n: usize) -> Result<Vec<ConversationTurn>> {
        self.window(session_id, n as i64).await
    }

    async fn history(&self, session_id: &str, limit: usize) -> Result<Vec<ConversationTurn>> {
        let limit = if limit == 0 { -1 } else { limit as i64 };
        self.window(session_id, limit).await
    }

    async fn turn_count(&self, session_id: &str) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM conversation_turns WHERE session_id = ?")
            .bind(session_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }
}
