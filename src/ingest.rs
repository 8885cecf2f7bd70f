//! Ingestion: the write path into the document index.
//!
//! ```text
//! content ─▶ chunk_text ─▶ for each piece: cache.embed ─▶ insert_chunk ─▶ flat index
//! ```
//!
//! A failure to store one piece is logged and skipped; siblings are still
//! stored and `chunk_index` stays contiguous over what was stored.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tutor_rag_core::chunk::chunk_text;
use tutor_rag_core::models::{Chunk, Metadata};
use tutor_rag_core::RagError;

use crate::config::Config;
use crate::context::AppContext;
use crate::search::DocumentIndex;

/// Metadata keys computed per chunk; caller values under these keys are
/// replaced.
pub const META_CHUNK_SIZE: &str = "chunk_size";
pub const META_TOTAL_CHUNKS: &str = "total_chunks";

/// One document to ingest.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestRequest {
    pub content: String,
    pub source: String,
    pub doc_type: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl DocumentIndex {
    /// Chunk, embed and store `request`; returns the number of chunks stored.
    pub async fn ingest(&self, request: &IngestRequest) -> Result<usize, RagError> {
        let source = request.source.trim();
        let doc_type = request.doc_type.trim();
        if source.is_empty() {
            return Err(RagError::invalid("source must not be empty"));
        }
        if doc_type.is_empty() {
            return Err(RagError::invalid("doc_type must not be empty"));
        }

        let _guard = self.ingest_lock.lock().await;
        if self.chunks.has_source(source).await.map_err(RagError::storage)? {
            return Err(RagError::invalid(format!(
                "source '{}' is already ingested; clear chunks before re-ingesting",
                source
            )));
        }

        let pieces = chunk_text(
            &request.content,
            self.chunking.max_chars,
            self.chunking.overlap_chars,
        );
        let total = pieces.len();
        let model = self.cache.model().to_string();
        let mut stored = 0usize;

        for (position, piece) in pieces.iter().enumerate() {
            let embedding = self.cache.embed(piece, &model).await;

            let mut metadata = request.metadata.clone();
            metadata.insert(META_CHUNK_SIZE.into(), json!(piece.chars().count()));
            metadata.insert(META_TOTAL_CHUNKS.into(), json!(total));

            let chunk = Chunk {
                id: Uuid::new_v4().to_string(),
                source_id: source.to_string(),
                document_type: doc_type.to_string(),
                raw_content: request.content.clone(),
                chunk_text: piece.clone(),
                chunk_index: stored as i64,
                metadata,
                embedding_dimensions: embedding.len(),
                embedding,
                embedding_model: model.clone(),
                created_at: Utc::now(),
            };

            match self.chunks.insert_chunk(&chunk).await {
                Ok(()) => {
                    self.index_chunk(&chunk);
                    stored += 1;
                    debug!(source, position, chunk_index = chunk.chunk_index, "chunk stored");
                }
                Err(e) => {
                    let err = RagError::IngestionChunkFailed {
                        source_id: source.to_string(),
                        index: position as i64,
                        reason: e.to_string(),
                    };
                    warn!(error = %err, "skipping chunk");
                }
            }
        }

        info!(source, doc_type, chunks = stored, planned = total, "document ingested");
        Ok(stored)
    }
}

/// Parse `key=value` pairs into metadata. Values that parse as JSON
/// (numbers, booleans, arrays) keep their type; anything else is a string.
pub fn parse_metadata_pairs(pairs: &[String]) -> Result<Metadata> {
    let mut metadata = Metadata::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("metadata must be key=value, got '{}'", pair))?;
        let key = key.trim();
        if key.is_empty() {
            anyhow::bail!("metadata key must not be empty in '{}'", pair);
        }
        let value = serde_json::from_str(value.trim()).unwrap_or_else(|_| json!(value.trim()));
        metadata.insert(key.to_string(), value);
    }
    Ok(metadata)
}

/// `tutor ingest <path>`
pub async fn run_ingest(
    config: &Config,
    path: &Path,
    source: Option<String>,
    doc_type: &str,
    meta: &[String],
) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let source = match source {
        Some(s) => s,
        None => path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .with_context(|| format!("Cannot derive a source label from {}", path.display()))?,
    };
    let metadata = parse_metadata_pairs(meta)?;

    let ctx = AppContext::open(config).await?;
    let request = IngestRequest {
        content,
        source: source.clone(),
        doc_type: doc_type.to_string(),
        metadata,
    };
    let stored = ctx.index.ingest(&request).await?;

    println!("ingest {}", source);
    println!("  document type: {}", doc_type);
    println!("  chunks written: {}", stored);
    println!("ok");
    Ok(())
}
