//! SQLite backend: the store contract, concurrent session updates, and
//! backend parity for retrieval.

use chrono::{Duration, Utc};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

use tutor_rag::cache::EmbeddingCache;
use tutor_rag::config::ChunkingConfig;
use tutor_rag::db;
use tutor_rag::embedding::PseudoEmbedder;
use tutor_rag::ingest::IngestRequest;
use tutor_rag::migrate;
use tutor_rag::search::DocumentIndex;
use tutor_rag::sqlite_store::SqliteStore;
use tutor_rag_core::models::{Chunk, ChunkRef, ConversationTurn, EditorContext, Metadata, TurnRole};
use tutor_rag_core::search::SearchParams;
use tutor_rag_core::store::{ChunkStore, EmbeddingCacheStore, SessionStore, TurnStore};

// ─── Helpers ────────────────────────────────────────────────────────

async fn open_store(tmp: &TempDir) -> Arc<SqliteStore> {
    let pool = db::connect_path(&tmp.path().join("tutor.sqlite")).await.unwrap();
    migrate::migrate(&pool).await.unwrap();
    Arc::new(SqliteStore::new(pool))
}

fn chunk(id: &str, source: &str, doc_type: &str, index: i64, embedding: Vec<f32>) -> Chunk {
    let mut metadata = Metadata::new();
    metadata.insert("lesson".into(), json!(1));
    Chunk {
        id: id.to_string(),
        source_id: source.to_string(),
        document_type: doc_type.to_string(),
        raw_content: format!("raw {}", source),
        chunk_text: format!("text of {}", id),
        chunk_index: index,
        metadata,
        embedding_dimensions: embedding.len(),
        embedding,
        embedding_model: "m".to_string(),
        created_at: Utc::now(),
    }
}

fn index_over(store: Arc<SqliteStore>, backend: &str) -> DocumentIndex {
    let cache = Arc::new(EmbeddingCache::new(
        store.clone(),
        Arc::new(PseudoEmbedder::new("pseudo", 32)),
        32,
    ));
    let chunking = ChunkingConfig {
        max_chars: 200,
        overlap_chars: 40,
    };
    DocumentIndex::new(store, cache, &chunking, backend).unwrap()
}

// ─── Chunks ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_chunk_store_roundtrip_and_order() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;

    store.insert_chunk(&chunk("b", "src-b", "lesson", 0, vec![1.0, 0.0])).await.unwrap();
    store.insert_chunk(&chunk("a", "src-a", "faq", 0, vec![0.0, 1.0])).await.unwrap();
    store.insert_chunk(&chunk("c", "src-b", "lesson", 1, vec![1.0, 1.0])).await.unwrap();

    let all = store.chunks(None).await.unwrap();
    let ids: Vec<&str> = all.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["b", "a", "c"]);
    assert_eq!(all[0].embedding, vec![1.0, 0.0]);
    assert_eq!(all[0].metadata["lesson"], json!(1));
    assert_eq!(store.chunks(Some("faq")).await.unwrap().len(), 1);

    // Duplicate (source, chunk_index) is rejected.
    assert!(store
        .insert_chunk(&chunk("d", "src-b", "lesson", 1, vec![1.0, 1.0]))
        .await
        .is_err());

    assert!(store.has_source("src-a").await.unwrap());
    assert!(!store.has_source("src-z").await.unwrap());
    let sources = store.list_sources().await.unwrap();
    assert_eq!(sources.len(), 2);
    let b = sources.iter().find(|s| s.source_id == "src-b").unwrap();
    assert_eq!(b.chunks, 2);

    let params = SearchParams {
        limit: 5,
        threshold: 0.5,
        doc_type: Some("lesson".into()),
    };
    let results = store.vector_search(&[1.0, 0.0], &params).await.unwrap();
    let ids: Vec<&str> = results.iter().map(|r| r.chunk.id.as_str()).collect();
    assert_eq!(ids, vec!["b", "c"]);

    assert_eq!(store.clear_chunks().await.unwrap(), 3);
    assert_eq!(store.chunk_count().await.unwrap(), 0);
}

// ─── Embedding cache ────────────────────────────────────────────────

#[tokio::test]
async fn test_cache_upsert_touch_and_evict() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    let t0 = Utc::now();

    assert!(store.touch("h", "m", t0).await.unwrap().is_none());
    let first = store.record("h", "m", &[1.0, 2.0], t0).await.unwrap();
    assert_eq!(first.usage_count, 1);
    assert_eq!(first.dimensions, 2);

    // A second record keeps the original vector and counts the use.
    let again = store.record("h", "m", &[9.0, 9.0], t0).await.unwrap();
    assert_eq!(again.usage_count, 2);
    assert_eq!(again.vector, vec![1.0, 2.0]);

    let hit = store.touch("h", "m", t0 + Duration::seconds(5)).await.unwrap().unwrap();
    assert_eq!(hit.usage_count, 3);
    assert!(store.cache_entry("h", "other").await.unwrap().is_none());

    store.record("old", "m", &[1.0], t0 - Duration::days(40)).await.unwrap();
    let removed = store.evict_older_than(t0 - Duration::days(30)).await.unwrap();
    assert_eq!(removed, 1);
    assert_eq!(store.cache_len().await.unwrap(), 1);
}

// ─── Sessions ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_session_create_update_and_persist() {
    let tmp = TempDir::new().unwrap();
    let now = Utc::now();
    {
        let store = open_store(&tmp).await;
        let a = store.get_or_create("s1", Some("u1"), 3, now).await.unwrap();
        let b = store.get_or_create("s1", None, 99, now).await.unwrap();
        assert_eq!(a.version, 0);
        assert_eq!(b.max_attempts, 3);
        assert_eq!(b.user_id.as_deref(), Some("u1"));

        let updated = store
            .update_session("s1", &|s| {
                s.increment_attempt(now, Duration::minutes(5));
                s.progress_data.insert("topics".into(), json!(["css"]));
            })
            .await
            .unwrap();
        assert_eq!(updated.attempt_count, 1);
        assert_eq!(updated.version, 1);
        assert!(store.update_session("missing", &|_| {}).await.is_err());
        store.pool().close().await;
    }

    let store = open_store(&tmp).await;
    let session = store.get_session("s1").await.unwrap().unwrap();
    assert_eq!(session.attempt_count, 1);
    assert_eq!(session.progress_data["topics"], json!(["css"]));
    assert!(store.get_session("s2").await.unwrap().is_none());
}

#[tokio::test]
async fn test_block_roundtrips_deadline() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    let now = Utc::now();
    store.get_or_create("s1", None, 2, now).await.unwrap();

    let blocked = store
        .update_session("s1", &|s| {
            s.increment_attempt(now, Duration::minutes(10));
            s.increment_attempt(now, Duration::minutes(10));
        })
        .await
        .unwrap();
    assert!(blocked.is_blocked);

    let loaded = store.get_session("s1").await.unwrap().unwrap();
    assert!(loaded.is_blocked);
    let until = loaded.blocked_until.unwrap();
    let expected = now + Duration::minutes(10);
    assert!((until - expected).num_milliseconds().abs() <= 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_increments_lose_nothing() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    let now = Utc::now();
    store.get_or_create("s1", None, 1000, now).await.unwrap();

    let handles: Vec<_> = (0..20)
        .map(|_| {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store
                    .update_session("s1", &|s| s.increment_attempt(now, Duration::minutes(5)))
                    .await
                    .unwrap();
            })
        })
        .collect();
    for h in handles {
        h.await.unwrap();
    }

    let session = store.get_session("s1").await.unwrap().unwrap();
    assert_eq!(session.attempt_count, 20);
    assert_eq!(session.version, 20);
}

// ─── Turns ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_turns_are_ordered_clamped_and_windowed() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    let t0 = Utc::now();

    for i in 0..6 {
        let sent = if i == 3 {
            t0 - Duration::seconds(60)
        } else {
            t0 + Duration::seconds(i)
        };
        let stored = store
            .append_turn(&ConversationTurn::user("s1", &format!("m{}", i), None, sent))
            .await
            .unwrap();
        if i == 3 {
            // Clamped to the latest earlier turn.
            assert!(stored.sent_at >= t0 + Duration::seconds(2) - Duration::milliseconds(1));
        }
    }
    store
        .append_turn(&ConversationTurn::user("other", "x", None, t0))
        .await
        .unwrap();

    let recent = store.recent_turns("s1", 3).await.unwrap();
    let contents: Vec<&str> = recent.iter().map(|t| t.content.as_str()).collect();
    assert_eq!(contents, vec!["m3", "m4", "m5"]);
    assert!(recent
        .windows(2)
        .all(|w| w[0].seq < w[1].seq && w[0].sent_at <= w[1].sent_at));
    assert_eq!(store.recent_turns("s1", 3).await.unwrap(), recent);
    assert!(store.recent_turns("s1", 0).await.unwrap().is_empty());

    assert_eq!(store.history("s1", 0).await.unwrap().len(), 6);
    assert_eq!(store.history("s1", 2).await.unwrap()[1].content, "m5");
    assert_eq!(store.turn_count("s1").await.unwrap(), 6);
    assert_eq!(store.turn_count("nobody").await.unwrap(), 0);
}

#[tokio::test]
async fn test_turn_payloads_roundtrip() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    let now = Utc::now();

    let editor = EditorContext {
        code: Some("<div class=\"row\"></div>".into()),
        instructions: Some("Make it a flex row".into()),
        feedback: None,
    };
    store
        .append_turn(&ConversationTurn::user("s1", "Why?", Some(editor.clone()), now))
        .await
        .unwrap();
    let refs = vec![ChunkRef {
        chunk_id: "c1".into(),
        source_id: "flexbox".into(),
        similarity: 0.8,
        excerpt: "Flexbox lays out...".into(),
    }];
    store
        .append_turn(&ConversationTurn::assistant("s1", "Because.", refs.clone(), 12, now))
        .await
        .unwrap();

    let turns = store.history("s1", 0).await.unwrap();
    assert_eq!(turns[0].role, TurnRole::User);
    assert_eq!(turns[0].editor_context.as_ref(), Some(&editor));
    assert!(turns[0].retrieved_chunks.is_none());
    assert_eq!(turns[1].role, TurnRole::Assistant);
    assert_eq!(turns[1].retrieved_chunks.as_ref(), Some(&refs));
    assert_eq!(turns[1].token_count, Some(12));
}

// ─── Retrieval parity ───────────────────────────────────────────────

/// `flat` and `exact` rank the same store identically, including after
/// the flat index is rebuilt from the store.
#[tokio::test]
async fn test_flat_and_exact_agree() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;

    let flat = index_over(store.clone(), "flat");
    flat.warm().await.unwrap();
    let lessons = [
        ("flexbox", "Flexbox aligns items along a main axis. Use justify-content and align-items to position children. Wrapping is controlled with flex-wrap."),
        ("grid", "CSS grid defines rows and columns. grid-template-columns sets the track sizes and grid-area places items by name."),
        ("events", "addEventListener registers a listener. Events bubble from the target up through its ancestors unless propagation is stopped."),
        ("forms", "A form groups inputs. Each input should have a label, and the submit button sends the form data to the action URL."),
    ];
    for (source, content) in lessons {
        flat.ingest(&IngestRequest {
            content: content.repeat(3),
            source: source.to_string(),
            doc_type: if source == "events" { "reference" } else { "lesson" }.to_string(),
            metadata: Metadata::new(),
        })
        .await
        .unwrap();
    }

    let sources = flat.list_sources().await.unwrap();
    let names: Vec<&str> = sources.iter().map(|s| s.source_id.as_str()).collect();
    assert_eq!(names, vec!["events", "flexbox", "forms", "grid"]);
    assert_eq!(
        sources.iter().map(|s| s.chunks).sum::<usize>(),
        flat.count().await.unwrap()
    );

    let exact = index_over(store.clone(), "exact");
    let rewarmed = index_over(store.clone(), "flat");
    assert_eq!(rewarmed.warm().await.unwrap(), store.chunk_count().await.unwrap());

    for params in [
        SearchParams { limit: 5, threshold: -1.0, doc_type: None },
        SearchParams { limit: 3, threshold: 0.0, doc_type: Some("lesson".into()) },
        SearchParams { limit: 50, threshold: -1.0, doc_type: Some("reference".into()) },
    ] {
        for query in ["how do I center items", "label for an input", "event bubbling"] {
            let a = flat.search_text(query, &params).await;
            let b = exact.search_text(query, &params).await;
            let c = rewarmed.search_text(query, &params).await;
            let key = |rs: &[tutor_rag_core::models::SearchResult]| {
                rs.iter()
                    .map(|r| (r.chunk.id.clone(), r.similarity_score))
                    .collect::<Vec<_>>()
            };
            assert_eq!(key(&a), key(&b), "query {:?} params {:?}", query, params);
            assert_eq!(key(&a), key(&c));
            assert!(a.len() <= params.limit);
            assert!(a.iter().all(|r| r.similarity_score > params.threshold));
            assert!(a
                .windows(2)
                .all(|w| w[0].similarity_score >= w[1].similarity_score));
        }
    }

    assert!(flat.clear().await.unwrap() > 0);
    let params = SearchParams { limit: 5, threshold: -1.0, doc_type: None };
    assert!(flat.search_text("anything", &params).await.is_empty());
    assert!(exact.search_text("anything", &params).await.is_empty());
}
