//! Embedding cache behavior: single-flight misses, usage counting,
//! degradation and eviction.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tutor_rag::cache::EmbeddingCache;
use tutor_rag::embedding::PseudoEmbedder;
use tutor_rag_core::embedding::{pseudo_embedding, text_digest, Embedder};
use tutor_rag_core::store::memory::InMemoryStore;
use tutor_rag_core::store::EmbeddingCacheStore;

const DIMS: usize = 8;

/// Live embedder that counts calls and can be told to fail the first N.
struct CountingEmbedder {
    calls: AtomicUsize,
    fail_first: usize,
    delay: Duration,
}

impl CountingEmbedder {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail_first: 0,
            delay: Duration::from_millis(50),
        }
    }

    fn failing_first(n: usize) -> Self {
        Self {
            fail_first: n,
            ..Self::new()
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Embedder for CountingEmbedder {
    fn model_name(&self) -> &str {
        "modelX"
    }

    fn dims(&self) -> usize {
        DIMS
    }

    async fn embed(&self, text: &str, _model: &str) -> Result<Vec<f32>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if call < self.fail_first {
            anyhow::bail!("backend unavailable");
        }
        let mut v = vec![0.0f32; DIMS];
        v[text.len() % DIMS] = 1.0;
        Ok(v)
    }
}

fn cache_over(store: Arc<InMemoryStore>, embedder: Arc<dyn Embedder>) -> Arc<EmbeddingCache> {
    Arc::new(EmbeddingCache::new(store, embedder, DIMS))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_misses_share_one_call() {
    let store = Arc::new(InMemoryStore::new());
    let embedder = Arc::new(CountingEmbedder::new());
    let cache = cache_over(store.clone(), embedder.clone());

    let a = tokio::spawn({
        let cache = cache.clone();
        async move { cache.embed("same text", "modelX").await }
    });
    let b = tokio::spawn({
        let cache = cache.clone();
        async move { cache.embed("same text", "modelX").await }
    });
    let (a, b) = (a.await.unwrap(), b.await.unwrap());

    assert_eq!(a, b);
    assert_eq!(embedder.calls(), 1);

    let entry = store
        .cache_entry(&text_digest("same text"), "modelX")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.usage_count, 2);
    assert_eq!(entry.dimensions, DIMS);

    let stats = cache.stats().await.unwrap();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.entries, 1);
}

#[tokio::test]
async fn test_usage_count_tracks_reads() {
    let store = Arc::new(InMemoryStore::new());
    let embedder = Arc::new(CountingEmbedder::new());
    let cache = cache_over(store.clone(), embedder.clone());

    for _ in 0..5 {
        cache.embed("What is a closure?", "modelX").await;
    }
    // Whitespace differences hit the same entry.
    cache.embed("  What is a   closure?  ", "modelX").await;

    assert_eq!(embedder.calls(), 1);
    let entry = store
        .cache_entry(&text_digest("What is a closure?"), "modelX")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.usage_count, 6);
}

#[tokio::test]
async fn test_models_are_cached_separately() {
    let store = Arc::new(InMemoryStore::new());
    let embedder = Arc::new(CountingEmbedder::new());
    let cache = cache_over(store.clone(), embedder.clone());

    cache.embed("margin vs padding", "modelX").await;
    cache.embed("margin vs padding", "modelY").await;

    assert_eq!(embedder.calls(), 2);
    assert_eq!(store.cache_len().await.unwrap(), 2);
}

/// A failing backend yields the pseudo-vector, which is never cached.
#[tokio::test]
async fn test_embedder_failure_degrades_without_caching() {
    let store = Arc::new(InMemoryStore::new());
    let embedder = Arc::new(CountingEmbedder::failing_first(1));
    let cache = cache_over(store.clone(), embedder.clone());

    let degraded = cache.embed("event bubbling", "modelX").await;
    assert_eq!(degraded, pseudo_embedding("event bubbling", "modelX", DIMS));
    assert_eq!(store.cache_len().await.unwrap(), 0);

    let live = cache.embed("event bubbling", "modelX").await;
    assert_ne!(live, degraded);
    assert_eq!(store.cache_len().await.unwrap(), 1);

    let stats = cache.stats().await.unwrap();
    assert_eq!(stats.fallbacks, 1);
    assert_eq!(stats.misses, 2);
    assert_eq!(embedder.calls(), 2);
}

#[tokio::test]
async fn test_offline_embedder_bypasses_cache() {
    let store = Arc::new(InMemoryStore::new());
    let cache = cache_over(store.clone(), Arc::new(PseudoEmbedder::new("pseudo", DIMS)));

    assert!(!cache.is_enabled());
    let v = cache.embed("box model", "pseudo").await;
    assert_eq!(v, pseudo_embedding("box model", "pseudo", DIMS));
    assert_eq!(store.cache_len().await.unwrap(), 0);

    let stats = cache.stats().await.unwrap();
    assert!(!stats.enabled);
    assert_eq!(stats.hits + stats.misses, 0);
}

#[tokio::test]
async fn test_eviction_drops_stale_entries() {
    let store = Arc::new(InMemoryStore::new());
    let cache = cache_over(store.clone(), Arc::new(CountingEmbedder::new()));

    let long_ago = chrono::Utc::now() - chrono::Duration::days(40);
    store
        .record(&text_digest("stale"), "modelX", &[1.0; DIMS], long_ago)
        .await
        .unwrap();
    cache.embed("fresh", "modelX").await;

    let removed = cache
        .evict_older_than(chrono::Duration::days(30))
        .await
        .unwrap();
    assert_eq!(removed, 1);
    assert_eq!(store.cache_len().await.unwrap(), 1);
    assert!(store
        .cache_entry(&text_digest("fresh"), "modelX")
        .await
        .unwrap()
        .is_some());
}

/// A caller dropped mid-embed (e.g. a disconnected HTTP client) must not
/// leave its key registered.
#[tokio::test]
async fn test_cancelled_embed_releases_its_key() {
    let store = Arc::new(InMemoryStore::new());
    let cache = cache_over(store.clone(), Arc::new(CountingEmbedder::new()));

    let task = tokio::spawn({
        let cache = cache.clone();
        async move { cache.embed("slow request", "modelX").await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(cache.stats().await.unwrap().inflight, 1);

    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());
    assert_eq!(cache.stats().await.unwrap().inflight, 0);
    assert_eq!(store.cache_len().await.unwrap(), 0);

    // Finished embeds release their key too.
    cache.embed("quick request", "modelX").await;
    assert_eq!(cache.stats().await.unwrap().inflight, 0);
}
