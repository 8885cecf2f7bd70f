//! Storage abstraction for Tutor RAG.
//!
//! One trait per persisted entity, so components depend only on what they
//! touch and backends (SQLite, in-memory) stay swappable.
//!
//! | Trait | Entity | Concurrency contract |
//! |-------|--------|----------------------|
//! | [`ChunkStore`] | [`Chunk`] | append-only, ingestion order preserved |
//! | [`EmbeddingCacheStore`] | [`EmbeddingCacheEntry`] | `(text_hash, model)` upsert is atomic |
//! | [`SessionStore`] | [`ChatSession`] | mutation serialized per session |
//! | [`TurnStore`] | [`ConversationTurn`] | per-session order matches append order |
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{
    ChatSession, Chunk, ConversationTurn, EmbeddingCacheEntry, SearchResult, SourceSummary,
};
use crate::search::{rank_by_similarity, SearchParams};

/// Session mutation applied under the store's per-session serialization.
///
/// May be invoked more than once when a backend retries after a
/// concurrent write, so it must not have side effects of its own.
pub type SessionMutation<'a> = &'a (dyn Fn(&mut ChatSession) + Send + Sync);

/// Chunk records and the reference similarity scan.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    async fn insert_chunk(&self, chunk: &Chunk) -> Result<()>;

    /// All chunks, optionally of one document type, in ingestion order.
    async fn chunks(&self, doc_type: Option<&str>) -> Result<Vec<Chunk>>;

    /// Brute-force cosine search over [`chunks`](ChunkStore::chunks).
    async fn vector_search(&self, query: &[f32], params: &SearchParams) -> Result<Vec<SearchResult>> {
        let candidates = self.chunks(params.doc_type.as_deref()).await?;
        Ok(rank_by_similarity(query, candidates, params))
    }

    async fn has_source(&self, source_id: &str) -> Result<bool>;

    async fn chunk_count(&self) -> Result<usize>;

    /// Delete every chunk; returns how many were removed.
    async fn clear_chunks(&self) -> Result<usize>;

    async fn list_sources(&self) -> Result<Vec<SourceSummary>>;
}

/// Content-addressed embedding cache rows.
#[async_trait]
pub trait EmbeddingCacheStore: Send + Sync {
    /// On hit, count one use and return the updated entry.
    async fn touch(&self, text_hash: &str, model: &str, now: DateTime<Utc>)
        -> Result<Option<EmbeddingCacheEntry>>;

    /// Insert with `usage_count = 1`, or count one use if the key already
    /// exists (the stored vector is kept). Atomic per key.
    async fn record(
        &self,
        text_hash: &str,
        model: &str,
        vector: &[f32],
        now: DateTime<Utc>,
    ) -> Result<EmbeddingCacheEntry>;

    /// Read without counting a use.
    async fn cache_entry(&self, text_hash: &str, model: &str) -> Result<Option<EmbeddingCacheEntry>>;

    /// Remove entries last used before `cutoff`; returns how many.
    async fn evict_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    async fn cache_len(&self) -> Result<usize>;
}

/// Chat sessions with serialized mutation.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Return the session, creating it if missing. Idempotent under races.
    async fn get_or_create(
        &self,
        session_id: &str,
        user_id: Option<&str>,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<ChatSession>;

    async fn get_session(&self, session_id: &str) -> Result<Option<ChatSession>>;

    /// Apply `mutate` to the latest state, persist it with `version + 1`,
    /// and return the stored session. Fails if the session does not exist.
    async fn update_session(&self, session_id: &str, mutate: SessionMutation<'_>) -> Result<ChatSession>;
}

/// Append-only conversation log.
#[async_trait]
pub trait TurnStore: Send + Sync {
    /// Persist `turn`; returns it with `seq` assigned and `sent_at`
    /// clamped to be no earlier than the session's last turn.
    async fn append_turn(&self, turn: &ConversationTurn) -> Result<ConversationTurn>;

    /// Last `n` turns, oldest first.
    async fn recent_turns(&self, session_id: &str, n: usize) -> Result<Vec<ConversationTurn>>;

    /// Most recent `limit` turns oldest first; `0` returns all.
    async fn history(&self, session_id: &str, limit: usize) -> Result<Vec<ConversationTurn>>;

    async fn turn_count(&self, session_id: &str) -> Result<usize>;
}
