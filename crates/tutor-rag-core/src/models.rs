//! Core data models used throughout Tutor RAG.
//!
//! These types represent the chunks, cache entries, sessions, and
//! conversation turns that flow through ingestion and the chat pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Free-form key/value map used for chunk metadata and session progress.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// A bounded slice of a source document, embedded and searchable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub source_id: String,
    pub document_type: String,
    /// Full original text of the source, identical across its chunks.
    pub raw_content: String,
    pub chunk_text: String,
    /// 0-based position within `source_id`.
    pub chunk_index: i64,
    pub metadata: Metadata,
    pub embedding: Vec<f32>,
    pub embedding_dimensions: usize,
    pub embedding_model: String,
    pub created_at: DateTime<Utc>,
}

/// A cached embedding keyed by `(text_hash, model)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingCacheEntry {
    pub text_hash: String,
    pub model: String,
    pub vector: Vec<f32>,
    pub dimensions: usize,
    pub usage_count: i64,
    pub last_used_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Per-session throttle and progress state.
///
/// Transitions live in [`crate::session`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSession {
    pub session_id: String,
    pub user_id: Option<String>,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub is_blocked: bool,
    pub blocked_until: Option<DateTime<Utc>>,
    pub last_activity: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub progress_data: Metadata,
    /// Bumped by the store on every persisted mutation.
    pub version: i64,
}

/// Author of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

impl TurnRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnRole::User => "user",
            TurnRole::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(TurnRole::User),
            "assistant" => Some(TurnRole::Assistant),
            _ => None,
        }
    }
}

/// Snapshot of the learner's editor at the time of the question.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EditorContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    /// Feedback previously shown to the learner for this exercise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

impl EditorContext {
    pub fn is_empty(&self) -> bool {
        [&self.code, &self.instructions, &self.feedback]
            .iter()
            .all(|f| f.as_deref().map_or(true, |s| s.trim().is_empty()))
    }
}

/// Reference to a chunk that grounded an assistant turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRef {
    pub chunk_id: String,
    pub source_id: String,
    pub similarity: f32,
    pub excerpt: String,
}

/// One immutable message in a session's conversation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// Store-assigned insertion counter; ties on `sent_at` break on this.
    pub seq: i64,
    pub turn_id: String,
    pub session_id: String,
    pub role: TurnRole,
    pub content: String,
    pub sent_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub editor_context: Option<EditorContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retrieved_chunks: Option<Vec<ChunkRef>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_count: Option<u32>,
}

impl ConversationTurn {
    /// A new user turn, not yet persisted (`seq` is assigned on append).
    pub fn user(
        session_id: &str,
        content: &str,
        editor_context: Option<EditorContext>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            seq: 0,
            turn_id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            role: TurnRole::User,
            content: content.to_string(),
            sent_at: now,
            editor_context: editor_context.filter(|e| !e.is_empty()),
            retrieved_chunks: None,
            token_count: None,
        }
    }

    /// A new assistant turn carrying its grounding references.
    pub fn assistant(
        session_id: &str,
        content: &str,
        retrieved_chunks: Vec<ChunkRef>,
        token_count: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            seq: 0,
            turn_id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            role: TurnRole::Assistant,
            content: content.to_string(),
            sent_at: now,
            editor_context: None,
            retrieved_chunks: Some(retrieved_chunks),
            token_count: Some(token_count),
        }
    }
}

/// A chunk paired with its similarity to a query. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub chunk: Chunk,
    pub similarity_score: f32,
}

impl SearchResult {
    /// Build the persisted reference for this result, with an excerpt of
    /// at most `excerpt_chars` characters.
    pub fn to_ref(&self, excerpt_chars: usize) -> ChunkRef {
        ChunkRef {
            chunk_id: self.chunk.id.clone(),
            source_id: self.chunk.source_id.clone(),
            similarity: self.similarity_score,
            excerpt: crate::prompt::truncate_chars(&self.chunk.chunk_text, excerpt_chars),
        }
    }
}

/// Per-source summary returned by `ChunkStore::list_sources`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceSummary {
    pub source_id: String,
    pub document_type: String,
    pub chunks: usize,
}
