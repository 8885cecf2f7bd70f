//! User-visible error kinds for the chat pipeline.
//!
//! Infrastructure failures are mostly recovered where they happen; the
//! variants that only ever get logged (`EmbeddingUnavailable`,
//! `IngestionChunkFailed`, `SearchBackend`) exist so degradations are
//! reported with the same vocabulary as surfaced errors.

use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum RagError {
    #[error("embedding backend unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("failed to store chunk {index} of '{source_id}': {reason}")]
    IngestionChunkFailed {
        source_id: String,
        index: i64,
        reason: String,
    },

    #[error("search backend error: {0}")]
    SearchBackend(String),

    #[error("completion unavailable: {message}")]
    CompletionUnavailable { message: String, retryable: bool },

    #[error("session is blocked{}", until.map(|u| format!(" until {}", u.to_rfc3339())).unwrap_or_default())]
    SessionBlocked { until: Option<DateTime<Utc>> },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl RagError {
    pub fn storage<E: std::fmt::Display>(err: E) -> Self {
        RagError::Storage(err.to_string())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        RagError::InvalidInput(message.into())
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            RagError::EmbeddingUnavailable(_) => "embedding_unavailable",
            RagError::IngestionChunkFailed { .. } => "ingestion_chunk_failed",
            RagError::SearchBackend(_) => "search_backend_error",
            RagError::CompletionUnavailable { .. } => "completion_unavailable",
            RagError::SessionBlocked { .. } => "session_blocked",
            RagError::InvalidInput(_) => "invalid_input",
            RagError::Storage(_) => "storage_error",
        }
    }

    /// Whether the same request may succeed if sent again right away.
    pub fn retryable(&self) -> bool {
        match self {
            RagError::CompletionUnavailable { retryable, .. } => *retryable,
            RagError::EmbeddingUnavailable(_)
            | RagError::SearchBackend(_)
            | RagError::Storage(_) => true,
            RagError::IngestionChunkFailed { .. }
            | RagError::SessionBlocked { .. }
            | RagError::InvalidInput(_) => false,
        }
    }
}
