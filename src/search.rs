//! Document index: similarity search over ingested chunks.
//!
//! Two backends answer the same query with identical rankings:
//!
//! | Backend | How |
//! |---------|-----|
//! | `exact` | [`ChunkStore::vector_search`], a brute-force scan of the store |
//! | `flat` | an in-process [`FlatIndex`] warmed from the store and kept current on ingest |
//!
//! Search never fails: backend errors are logged and yield no results.
//! Ingestion lives in [`crate::ingest`].

use anyhow::{anyhow, bail, Result};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{info, warn};

use tutor_rag_core::index::FlatIndex;
use tutor_rag_core::models::{Chunk, SearchResult, SourceSummary};
use tutor_rag_core::search::SearchParams;
use tutor_rag_core::store::ChunkStore;
use tutor_rag_core::RagError;

use crate::cache::EmbeddingCache;
use crate::config::{ChunkingConfig, Config};
use crate::context::AppContext;

pub struct DocumentIndex {
    pub(crate) chunks: Arc<dyn ChunkStore>,
    pub(crate) cache: Arc<EmbeddingCache>,
    pub(crate) chunking: ChunkingConfig,
    flat: Option<RwLock<FlatIndex>>,
    /// Serializes ingestion so store order and flat-index order agree.
    pub(crate) ingest_lock: Mutex<()>,
}

impl DocumentIndex {
    pub fn new(
        chunks: Arc<dyn ChunkStore>,
        cache: Arc<EmbeddingCache>,
        chunking: &ChunkingConfig,
        backend: &str,
    ) -> Result<Self> {
        let flat = match backend {
            "exact" => None,
            "flat" => Some(RwLock::new(FlatIndex::new())),
            other => bail!("Unknown retrieval backend: {}", other),
        };
        Ok(Self {
            chunks,
            cache,
            chunking: chunking.clone(),
            flat,
            ingest_lock: Mutex::new(()),
        })
    }

    pub fn backend_name(&self) -> &'static str {
        if self.flat.is_some() {
            "flat"
        } else {
            "exact"
        }
    }

    pub fn cache(&self) -> &EmbeddingCache {
        &self.cache
    }

    /// Load every stored chunk into the flat index. No-op for `exact`.
    pub async fn warm(&self) -> Result<usize> {
        let Some(flat) = &self.flat else {
            return Ok(0);
        };
        let chunks = self.chunks.chunks(None).await?;
        let loaded = chunks.len();
        let mut index = flat
            .write()
            .map_err(|_| anyhow!("flat index lock poisoned"))?;
        *index = FlatIndex::from_chunks(chunks);
        info!(chunks = loaded, "flat index warmed");
        Ok(loaded)
    }

    pub(crate) fn index_chunk(&self, chunk: &Chunk) {
        if let Some(flat) = &self.flat {
            match flat.write() {
                Ok(mut index) => index.insert(chunk.clone()),
                Err(_) => warn!(chunk_id = %chunk.id, "flat index lock poisoned; chunk not indexed"),
            }
        }
    }

    /// Top matches for `query` (already embedded).
    pub async fn search(&self, query: &[f32], params: &SearchParams) -> Vec<SearchResult> {
        let outcome = match &self.flat {
            Some(flat) => search_flat(flat, query, params),
            None => self
                .chunks
                .vector_search(query, params)
                .await
                .map_err(|e| RagError::SearchBackend(e.to_string())),
        };

        match outcome {
            Ok(results) => results,
            Err(e) => {
                warn!(error = %e, backend = self.backend_name(), "search degraded to empty result set");
                Vec::new()
            }
        }
    }

    /// Embed `query` through the cache, then [`search`](Self::search).
    pub async fn search_text(&self, query: &str, params: &SearchParams) -> Vec<SearchResult> {
        if query.trim().is_empty() {
            return Vec::new();
        }
        let vector = self.cache.embed(query, self.cache.model()).await;
        self.search(&vector, params).await
    }

    pub async fn count(&self) -> Result<usize> {
        self.chunks.chunk_count().await
    }

    /// Ingested sources with their chunk counts, sorted by source id.
    pub async fn list_sources(&self) -> Result<Vec<SourceSummary>> {
        self.chunks.list_sources().await
    }

    /// Delete every chunk from the store and the flat index.
    pub async fn clear(&self) -> Result<usize> {
        let _guard = self.ingest_lock.lock().await;
        let removed = self.chunks.clear_chunks().await?;
        if let Some(flat) = &self.flat {
            flat.write()
                .map_err(|_| anyhow!("flat index lock poisoned"))?
                .clear();
        }
        info!(removed, "chunks cleared");
        Ok(removed)
    }
}

fn search_flat(
    flat: &RwLock<FlatIndex>,
    query: &[f32],
    params: &SearchParams,
) -> std::result::Result<Vec<SearchResult>, RagError> {
    let index = flat
        .read()
        .map_err(|_| RagError::SearchBackend("flat index lock poisoned".into()))?;
    Ok(index.search(query, params))
}

/// `tutor search <query>`
pub async fn run_search(
    config: &Config,
    query: &str,
    limit: Option<usize>,
    threshold: Option<f32>,
    doc_type: Option<String>,
) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }

    let ctx = AppContext::open(config).await?;
    let mut params = config.retrieval.search_params();
    if let Some(limit) = limit {
        params.limit = config.retrieval.clamp_limit(limit);
    }
    if let Some(threshold) = threshold {
        params.threshold = threshold;
    }
    if doc_type.is_some() {
        params.doc_type = doc_type;
    }

    let results = ctx.index.search_text(query, &params).await;
    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, result) in results.iter().enumerate() {
        println!(
            "{}. [{:.3}] {} #{} ({})",
            i + 1,
            result.similarity_score,
            result.chunk.source_id,
            result.chunk.chunk_index,
            result.chunk.document_type
        );
        println!(
            "    excerpt: \"{}\"",
            tutor_rag_core::prompt::truncate_chars(&result.chunk.chunk_text, 160)
                .replace('\n', " ")
                .trim()
        );
        println!("    id: {}", result.chunk.id);
        println!();
    }
    Ok(())
}

/// `tutor chunks list`
pub async fn run_list_sources(config: &Config) -> Result<()> {
    let ctx = AppContext::open(config).await?;
    let sources = ctx.index.list_sources().await?;
    if sources.is_empty() {
        println!("No chunks stored.");
        return Ok(());
    }

    println!("{:<32} {:<16} {:>8}", "SOURCE", "TYPE", "CHUNKS");
    for s in &sources {
        println!("{:<32} {:<16} {:>8}", s.source_id, s.document_type, s.chunks);
    }
    println!();
    println!("{} chunks in {} sources", ctx.index.count().await?, sources.len());
    Ok(())
}

/// `tutor chunks clear`
pub async fn run_clear(config: &Config) -> Result<()> {
    let ctx = AppContext::open(config).await?;
    let removed = ctx.index.clear().await?;
    println!("Removed {} chunks.", removed);
    Ok(())
}
