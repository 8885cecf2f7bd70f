//! Content-addressed embedding cache.
//!
//! [`EmbeddingCache::embed`] never fails: every path ends in a vector.
//!
//! ```text
//! embedder not live ─────────────────────────────▶ pseudo-vector
//! live: lock key ─▶ touch(hash, model) ── hit ───▶ cached vector
//!                        │ miss
//!                        ▼
//!                  embedder.embed ── ok ──▶ record(usage = 1) ─▶ vector
//!                        │ err
//!                        ▼
//!                  pseudo-vector (not cached, fallbacks += 1)
//! ```
//!
//! Misses for the same `(text_hash, model)` are coalesced behind a per-key
//! async mutex, so concurrent callers trigger one embedder call and each
//! counts one use.

use anyhow::Result;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

use chrono::Utc;
use tutor_rag_core::embedding::{pseudo_embedding, text_digest, Embedder};
use tutor_rag_core::store::EmbeddingCacheStore;
use tutor_rag_core::RagError;

use crate::config::Config;
use crate::context::AppContext;

type KeyLock = Arc<tokio::sync::Mutex<()>>;
type InflightKey = (String, String);

struct InflightSlot<'a> {
    cache: &'a EmbeddingCache,
    key: InflightKey,
    lock: KeyLock,
}

impl Drop for InflightSlot<'_> {
    /// Drop the registry entry once no other caller holds or waits on it.
    fn drop(&mut self) {
        let mut inflight = self.cache.inflight();
        // One reference in the map, one here.
        if Arc::strong_count(&self.lock) <= 2 {
            inflight.remove(&self.key);
        }
    }
}

/// Counters reported by `tutor cache stats`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CacheStats {
    pub enabled: bool,
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub fallbacks: u64,
    /// Keys with an embed in progress.
    pub inflight: usize,
}

pub struct EmbeddingCache {
    store: Arc<dyn EmbeddingCacheStore>,
    embedder: Arc<dyn Embedder>,
    dims: usize,
    inflight: Mutex<HashMap<InflightKey, KeyLock>>,
    hits: AtomicU64,
    misses: AtomicU64,
    fallbacks: AtomicU64,
}

impl EmbeddingCache {
    /// `dims` sizes the pseudo-vectors used when the embedder is offline
    /// or failing.
    pub fn new(store: Arc<dyn EmbeddingCacheStore>, embedder: Arc<dyn Embedder>, dims: usize) -> Self {
        Self {
            store,
            embedder,
            dims,
            inflight: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
        }
    }

    /// Caching only happens in front of a live embedder.
    pub fn is_enabled(&self) -> bool {
        self.embedder.is_live()
    }

    /// Model used when callers don't name one.
    pub fn model(&self) -> &str {
        self.embedder.model_name()
    }

    /// Vector for `text` under `model`.
    pub async fn embed(&self, text: &str, model: &str) -> Vec<f32> {
        if !self.is_enabled() {
            return pseudo_embedding(text, model, self.dims);
        }

        let hash = text_digest(text);
        let slot = self.claim(&hash, model);
        let _guard = slot.lock.lock().await;
        self.embed_locked(text, &hash, model).await
    }

    async fn embed_locked(&self, text: &str, hash: &str, model: &str) -> Vec<f32> {
        match self.store.touch(hash, model, Utc::now()).await {
            Ok(Some(entry)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(model, usage_count = entry.usage_count, "embedding cache hit");
                return entry.vector;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "embedding cache unavailable; calling embedder directly");
                return self.embed_uncached(text, model).await;
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let vector = match self.embedder.embed(text, model).await {
            Ok(v) => v,
            Err(e) => return self.degrade(text, model, e),
        };

        if let Err(e) = self.store.record(hash, model, &vector, Utc::now()).await {
            warn!(error = %e, "failed to persist embedding cache entry");
        }
        vector
    }

    async fn embed_uncached(&self, text: &str, model: &str) -> Vec<f32> {
        match self.embedder.embed(text, model).await {
            Ok(v) => v,
            Err(e) => self.degrade(text, model, e),
        }
    }

    fn degrade(&self, text: &str, model: &str, err: anyhow::Error) -> Vec<f32> {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
        let err = RagError::EmbeddingUnavailable(err.to_string());
        warn!(model, error = %err, "using pseudo-embedding");
        pseudo_embedding(text, model, self.dims)
    }

    fn inflight(&self) -> MutexGuard<'_, HashMap<InflightKey, KeyLock>> {
        match self.inflight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register interest in a key. The returned slot releases it on drop,
    /// including when the caller's future is cancelled mid-embed.
    fn claim(&self, hash: &str, model: &str) -> InflightSlot<'_> {
        let key = (hash.to_string(), model.to_string());
        let lock = Arc::clone(self.inflight().entry(key.clone()).or_default());
        InflightSlot {
            cache: self,
            key,
            lock,
        }
    }

    /// Remove entries unused for longer than `max_age`.
    pub async fn evict_older_than(&self, max_age: chrono::Duration) -> Result<usize> {
        self.store.evict_older_than(Utc::now() - max_age).await
    }

    pub async fn stats(&self) -> Result<CacheStats> {
        Ok(CacheStats {
            enabled: self.is_enabled(),
            entries: self.store.cache_len().await?,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            inflight: self.inflight().len(),
        })
    }
}

/// `tutor cache stats`
pub async fn run_cache_stats(config: &Config) -> Result<()> {
    let ctx = AppContext::open(config).await?;
    let stats = ctx.cache.stats().await?;
    println!("Embedding cache");
    println!("  enabled:  {}", stats.enabled);
    println!("  model:    {}", ctx.cache.model());
    println!("  entries:  {}", stats.entries);
    Ok(())
}

/// `tutor cache evict [--days N]`
pub async fn run_cache_evict(config: &Config, days: Option<u32>) -> Result<()> {
    let Some(days) = days.or(config.embedding.max_age_days) else {
        anyhow::bail!("No horizon given: pass --days or set embedding.max_age_days");
    };
    let ctx = AppContext::open(config).await?;
    let removed = ctx
        .cache
        .evict_older_than(chrono::Duration::days(i64::from(days)))
        .await?;
    println!("Evicted {} cache entries unused for more than {} days.", removed, days);
    Ok(())
}
