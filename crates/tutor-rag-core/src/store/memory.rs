//! In-memory store implementing every storage trait.
//!
//! Each entity lives behind its own `std::sync::Mutex`; holding the lock
//! for the whole read-modify-write is what serializes session mutation and
//! makes the cache upsert atomic. Used by tests and by the app crate when
//! no database is wanted.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{ChunkStore, EmbeddingCacheStore, SessionMutation, SessionStore, TurnStore};
use crate::models::{ChatSession, Chunk, ConversationTurn, EmbeddingCacheEntry, SourceSummary};

#[derive(Default)]
struct TurnLog {
    next_seq: i64,
    by_session: HashMap<String, Vec<ConversationTurn>>,
}

/// In-memory store for tests and database-free runs.
#[derive(Default)]
pub struct InMemoryStore {
    chunks: Mutex<Vec<Chunk>>,
    cache: Mutex<HashMap<(String, String), EmbeddingCacheEntry>>,
    sessions: Mutex<HashMap<String, ChatSession>>,
    turns: Mutex<TurnLog>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| anyhow!("in-memory store lock poisoned"))
}

fn cache_key(text_hash: &str, model: &str) -> (String, String) {
    (text_hash.to_string(), model.to_string())
}

#[async_trait]
impl ChunkStore for InMemoryStore {
    async fn insert_chunk(&self, chunk: &Chunk) -> Result<()> {
        let mut chunks = lock(&self.chunks)?;
        if chunks.iter().any(|c| c.id == chunk.id) {
            bail!("duplicate chunk id {}", chunk.id);
        }
        chunks.push(chunk.clone());
        Ok(())
    }

    async fn chunks(&self, doc_type: Option<&str>) -> Result<Vec<Chunk>> {
        let chunks = lock(&self.chunks)?;
        Ok(chunks
            .iter()
            .filter(|c| doc_type.map_or(true, |t| c.document_type == t))
            .cloned()
            .collect())
    }

    async fn has_source(&self, source_id: &str) -> Result<bool> {
        Ok(lock(&self.chunks)?.iter().any(|c| c.source_id == source_id))
    }

    async fn chunk_count(&self) -> Result<usize> {
        Ok(lock(&self.chunks)?.len())
    }

    async fn clear_chunks(&self) -> Result<usize> {
        let mut chunks = lock(&self.chunks)?;
        let removed = chunks.len();
        chunks.clear();
        Ok(removed)
    }

    async fn list_sources(&self) -> Result<Vec<SourceSummary>> {
        let chunks = lock(&self.chunks)?;
        let mut sources: Vec<SourceSummary> = Vec::new();
        for chunk in chunks.iter() {
            match sources.iter_mut().find(|s| s.source_id == chunk.source_id) {
                Some(summary) => summary.chunks += 1,
                None => sources.push(SourceSummary {
                    source_id: chunk.source_id.clone(),
                    document_type: chunk.document_type.clone(),
                    chunks: 1,
                }),
            }
        }
        sources.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        Ok(sources)
    }
}

#[async_trait]
impl EmbeddingCacheStore for InMemoryStore {
    async fn touch(
        &self,
        text_hash: &str,
        model: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<EmbeddingCacheEntry>> {
        let mut cache = lock(&self.cache)?;
        Ok(cache.get_mut(&cache_key(text_hash, model)).map(|entry| {
            entry.usage_count += 1;
            entry.last_used_at = now;
            entry.clone()
        }))
    }

    async fn record(
        &self,
        text_hash: &str,
        model: &str,
        vector: &[f32],
        now: DateTime<Utc>,
    ) -> Result<EmbeddingCacheEntry> {
        let mut cache = lock(&self.cache)?;
        let entry = cache
            .entry(cache_key(text_hash, model))
            .and_modify(|e| {
                e.usage_count += 1;
                e.last_used_at = now;
            })
            .or_insert_with(|| EmbeddingCacheEntry {
                text_hash: text_hash.to_string(),
                model: model.to_string(),
                vector: vector.to_vec(),
                dimensions: vector.len(),
                usage_count: 1,
                last_used_at: now,
                created_at: now,
            });
        Ok(entry.clone())
    }

    async fn cache_entry(&self, text_hash: &str, model: &str) -> Result<Option<EmbeddingCacheEntry>> {
        Ok(lock(&self.cache)?.get(&cache_key(text_hash, model)).cloned())
    }

    async fn evict_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut cache = lock(&self.cache)?;
        let before = cache.len();
        cache.retain(|_, e| e.last_used_at >= cutoff);
        Ok(before - cache.len())
    }

    async fn cache_len(&self) -> Result<usize> {
        Ok(lock(&self.cache)?.len())
    }
}

#[async_trait]
impl SessionStore for InMemoryStore {
    async fn get_or_create(
        &self,
        session_id: &str,
        user_id: Option<&str>,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<ChatSession> {
        let mut sessions = lock(&self.sessions)?;
        Ok(sessions
            .entry(session_id.to_string())
            .or_insert_with(|| ChatSession::new(session_id, user_id, max_attempts, now))
            .clone())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<ChatSession>> {
        Ok(lock(&self.sessions)?.get(session_id).cloned())
    }

    async fn update_session(&self, session_id: &str, mutate: SessionMutation<'_>) -> Result<ChatSession> {
        let mut sessions = lock(&self.sessions)?;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| anyhow!("session not found: {}", session_id))?;
        mutate(session);
        session.version += 1;
        Ok(session.clone())
    }
}

#[async_trait]
impl TurnStore for InMemoryStore {
    async fn append_turn(&self, turn: &ConversationTurn) -> Result<ConversationTurn> {
        let mut log = lock(&self.turns)?;
        log.next_seq += 1;
        let seq = log.next_seq;

        let turns = log.by_session.entry(turn.session_id.clone()).or_default();
        if turns.iter().any(|t| t.turn_id == turn.turn_id) {
            bail!("duplicate turn id {}", turn.turn_id);
        }
        let mut stored = turn.clone();
        stored.seq = seq;
        if let Some(last) = turns.last() {
            stored.sent_at = stored.sent_at.max(last.sent_at);
        }
        turns.push(stored.clone());
        Ok(stored)
    }

    async fn recent_turns(&self, session_id: &str, n: usize) -> Result<Vec<ConversationTurn>> {
        let log = lock(&self.turns)?;
        Ok(log
            .by_session
            .get(session_id)
            .map(|turns| turns[turns.len().saturating_sub(n)..].to_vec())
            .unwrap_or_default())
    }

    async fn history(&self, session_id: &str, limit: usize) -> Result<Vec<ConversationTurn>> {
        if limit == 0 {
            let log = lock(&self.turns)?;
            return Ok(log.by_session.get(session_id).cloned().unwrap_or_default());
        }
        self.recent_turns(session_id, limit).await
    }

    async fn turn_count(&self, session_id: &str) -> Result<usize> {
        Ok(lock(&self.turns)?
            .by_session
            .get(session_id)
            .map_or(0, Vec::len))
    }
}
