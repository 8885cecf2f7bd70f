//! Wiring: builds every shared component from configuration.

use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use tutor_rag_core::completion::Completer;
use tutor_rag_core::embedding::Embedder;
use tutor_rag_core::store::{ChunkStore, EmbeddingCacheStore, SessionStore, TurnStore};

use crate::cache::EmbeddingCache;
use crate::chat::{ChatSettings, RagOrchestrator};
use crate::completion::create_completer;
use crate::config::Config;
use crate::db;
use crate::embedding::create_embedder;
use crate::migrate;
use crate::search::DocumentIndex;
use crate::sqlite_store::SqliteStore;

/// Shared, cheaply clonable handles to the running pipeline.
#[derive(Clone)]
pub struct AppContext {
    pub config: Config,
    pub sessions: Arc<dyn SessionStore>,
    pub turns: Arc<dyn TurnStore>,
    pub cache: Arc<EmbeddingCache>,
    pub index: Arc<DocumentIndex>,
    pub orchestrator: Arc<RagOrchestrator>,
}

impl AppContext {
    /// Open the SQLite database (migrating it) and build the providers
    /// named in `config`.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::migrate(&pool).await?;
        let store = Arc::new(SqliteStore::new(pool));
        let embedder = create_embedder(&config.embedding)?;
        let completer = create_completer(&config.completion)?;
        Self::assemble(config, store, embedder, completer).await
    }

    /// Build the pipeline over any backend implementing every store trait.
    pub async fn assemble<S>(
        config: &Config,
        store: Arc<S>,
        embedder: Arc<dyn Embedder>,
        completer: Arc<dyn Completer>,
    ) -> Result<Self>
    where
        S: ChunkStore + EmbeddingCacheStore + SessionStore + TurnStore + 'static,
    {
        config.validate()?;

        let chunks: Arc<dyn ChunkStore> = store.clone();
        let cache_store: Arc<dyn EmbeddingCacheStore> = store.clone();
        let sessions: Arc<dyn SessionStore> = store.clone();
        let turns: Arc<dyn TurnStore> = store;

        let cache = Arc::new(EmbeddingCache::new(cache_store, embedder, config.embedding.dims));
        let index = Arc::new(DocumentIndex::new(
            chunks,
            cache.clone(),
            &config.chunking,
            &config.retrieval.backend,
        )?);
        index.warm().await?;

        let orchestrator = Arc::new(RagOrchestrator::new(
            sessions.clone(),
            turns.clone(),
            index.clone(),
            completer.clone(),
            ChatSettings::from_config(config),
        ));

        info!(
            backend = index.backend_name(),
            embedder = cache.model(),
            cache_enabled = cache.is_enabled(),
            completer = completer.name(),
            "pipeline ready"
        );

        Ok(Self {
            config: config.clone(),
            sessions,
            turns,
            cache,
            index,
            orchestrator,
        })
    }
}
