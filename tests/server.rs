//! HTTP surface tests: a real listener on an ephemeral port, driven with
//! reqwest.

use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;

use tutor_rag::completion::OfflineCompleter;
use tutor_rag::config::Config;
use tutor_rag::context::AppContext;
use tutor_rag::embedding::PseudoEmbedder;
use tutor_rag::server::router;
use tutor_rag_core::store::memory::InMemoryStore;

/// Serve a fresh in-memory pipeline; returns its base URL.
async fn spawn_server(config: Config) -> String {
    let store = Arc::new(InMemoryStore::new());
    let embedder = Arc::new(PseudoEmbedder::new("pseudo", config.embedding.dims));
    let ctx = AppContext::assemble(&config, store, embedder, Arc::new(OfflineCompleter))
        .await
        .unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(ctx)).await.ok();
    });
    format!("http://{}", addr)
}

fn test_config(tmp: &TempDir) -> Config {
    let mut config = Config::minimal(tmp.path().join("tutor.sqlite"));
    config.session.max_attempts = 2;
    config.retrieval.threshold = -1.0;
    config.embedding.dims = 32;
    config
}

#[tokio::test]
async fn test_health() {
    let tmp = TempDir::new().unwrap();
    let base = spawn_server(test_config(&tmp)).await;

    let resp = reqwest::get(format!("{}/health", base)).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_ingest_search_and_chat() {
    let tmp = TempDir::new().unwrap();
    let base = spawn_server(test_config(&tmp)).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/ingest", base))
        .json(&json!({
            "content": "Media queries adapt a layout to the viewport width.",
            "source": "responsive-1",
            "doc_type": "lesson",
            "metadata": { "lesson": 7 }
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["chunks"], 1);
    assert_eq!(body["source"], "responsive-1");

    let resp = client
        .post(format!("{}/search", base))
        .json(&json!({ "query": "viewport", "limit": 3 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    let results = body["results"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["chunk"]["source_id"], "responsive-1");
    assert!(results[0]["similarity_score"].is_number());

    let resp = client
        .post(format!("{}/chat", base))
        .json(&json!({
            "session_id": "web-1",
            "question": "How do media queries work?",
            "editor": { "code": "@media (max-width: 600px) {}" }
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert!(!body["content"].as_str().unwrap().is_empty());
    assert_eq!(body["retrieved_source_ids"], json!(["responsive-1"]));
    assert_eq!(body["attempts_remaining"], 1);
    assert_eq!(body["fallback"], true);

    let resp = client
        .get(format!("{}/sessions/web-1/history?limit=1", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    let turns = body["turns"].as_array().unwrap();
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0]["role"], "assistant");

    let resp = client
        .get(format!("{}/sessions/web-1", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["session_id"], "web-1");
    assert_eq!(body["attempt_count"], 1);
    assert_eq!(body["state"], "active");
    assert_eq!(body["turns"], 2);

    // Re-ingesting the same source is a client error.
    let resp = client
        .post(format!("{}/ingest", base))
        .json(&json!({ "content": "x", "source": "responsive-1", "doc_type": "lesson" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_blocked_session_envelope_and_reset() {
    let tmp = TempDir::new().unwrap();
    let base = spawn_server(test_config(&tmp)).await;
    let client = reqwest::Client::new();
    let ask = |q: &str| {
        client
            .post(format!("{}/chat", base))
            .json(&json!({ "session_id": "web-2", "question": q }))
            .send()
    };

    assert_eq!(ask("first").await.unwrap().status(), 200);
    assert_eq!(ask("second").await.unwrap().status(), 200);

    let resp = ask("third").await.unwrap();
    assert_eq!(resp.status(), 429);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "session_blocked");
    assert_eq!(body["error"]["retryable"], false);
    assert!(body["error"]["blocked_until"].is_string());

    let resp = client
        .post(format!("{}/sessions/web-2/reset", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["attempt_count"], 0);
    assert_eq!(body["state"], "active");

    assert_eq!(ask("fourth").await.unwrap().status(), 200);
}

#[tokio::test]
async fn test_client_errors() {
    let tmp = TempDir::new().unwrap();
    let base = spawn_server(test_config(&tmp)).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/chat", base))
        .json(&json!({ "session_id": "web-3", "question": "  " }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "invalid_input");
    assert_eq!(body["error"]["retryable"], false);
    assert!(body["error"].get("blocked_until").is_none());

    let resp = client
        .post(format!("{}/search", base))
        .json(&json!({ "query": "" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = client
        .get(format!("{}/sessions/nobody", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "not_found");

    let resp = client
        .get(format!("{}/sessions/nobody/history", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "not_found");

    let resp = client
        .post(format!("{}/sessions/nobody/reset", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let resp = client
        .get(format!("{}/sessions/bad%20id", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = client
        .get(format!("{}/cache/stats", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["enabled"], false);
}

#[tokio::test]
async fn test_search_limit_is_capped() {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(&tmp);
    config.retrieval.backend = "flat".to_string();
    config.retrieval.top_k = 2;
    config.retrieval.max_limit = 2;
    let base = spawn_server(config).await;
    let client = reqwest::Client::new();

    for (source, content) in [
        ("grid", "Grid tracks are sized with grid-template-columns."),
        ("flexbox", "Flex items share space along the main axis."),
        ("events", "Events bubble up through ancestor elements."),
    ] {
        let resp = client
            .post(format!("{}/ingest", base))
            .json(&json!({ "content": content, "source": source, "doc_type": "lesson" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
    }

    for limit in [json!(1099511627776u64), json!(u64::MAX)] {
        let resp = client
            .post(format!("{}/search", base))
            .json(&json!({ "query": "layout", "limit": limit }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["results"].as_array().unwrap().len(), 2);
    }

    // The server is still up.
    let resp = reqwest::get(format!("{}/health", base)).await.unwrap();
    assert_eq!(resp.status(), 200);
}
