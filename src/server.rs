//! HTTP server exposing the tutoring pipeline.
//!
//! Endpoints:
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/chat` | Answer one question for a session |
//! | `POST` | `/ingest` | Chunk, embed and store a document |
//! | `POST` | `/search` | Similarity search over stored chunks |
//! | `GET`  | `/sessions/{id}` | Session snapshot |
//! | `GET`  | `/sessions/{id}/history` | Conversation turns (`?limit=`) |
//! | `POST` | `/sessions/{id}/reset` | Clear attempts and block |
//! | `GET`  | `/cache/stats` | Embedding cache counters |
//! | `GET`  | `/health` | Health check |
//!
//! Errors share one envelope:
//!
//! ```json
//! { "error": { "code": "session_blocked", "message": "...", "retryable": false,
//!              "blocked_until": "2025-01-01T12:00:00Z" } }
//! ```

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

use tutor_rag_core::models::{ConversationTurn, SearchResult};
use tutor_rag_core::RagError;

use crate::cache::CacheStats;
use crate::chat::{validate_session_id, Answer, AnswerRequest};
use crate::config::Config;
use crate::context::AppContext;
use crate::ingest::IngestRequest;
use crate::sessions::{self, SessionView};

/// Build the router over an assembled pipeline.
pub fn router(ctx: AppContext) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/chat", post(handle_chat))
        .route("/ingest", post(handle_ingest))
        .route("/search", post(handle_search))
        .route("/sessions/{id}", get(handle_session))
        .route("/sessions/{id}/history", get(handle_history))
        .route("/sessions/{id}/reset", post(handle_reset))
        .route("/cache/stats", get(handle_cache_stats))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(ctx)
}

/// Start the HTTP server on `server.bind`.
///
/// When `embedding.max_age_days` is set, stale cache entries are evicted
/// once before the listener opens.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let ctx = AppContext::open(config).await?;

    if let Some(days) = config.embedding.max_age_days {
        match ctx
            .cache
            .evict_older_than(chrono::Duration::days(i64::from(days)))
            .await
        {
            Ok(removed) => info!(removed, days, "evicted stale cache entries"),
            Err(e) => warn!(error = %e, "cache eviction failed"),
        }
    }

    let bind_addr = config.server.bind.clone();
    let app = router(ctx);

    println!("Tutor server listening on http://{}", bind_addr);
    info!(bind = %bind_addr, "server started");

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    /// Machine-readable error code (e.g., `"invalid_input"`).
    code: String,
    message: String,
    retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    blocked_until: Option<DateTime<Utc>>,
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    detail: ErrorDetail,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { error: self.detail })).into_response()
    }
}

impl From<RagError> for AppError {
    fn from(err: RagError) -> Self {
        let status = match &err {
            RagError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            RagError::SessionBlocked { .. } => StatusCode::TOO_MANY_REQUESTS,
            RagError::CompletionUnavailable { .. }
            | RagError::EmbeddingUnavailable(_)
            | RagError::SearchBackend(_) => StatusCode::SERVICE_UNAVAILABLE,
            RagError::Storage(_) | RagError::IngestionChunkFailed { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let blocked_until = match &err {
            RagError::SessionBlocked { until } => *until,
            _ => None,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %err, "request failed");
        }
        AppError {
            status,
            detail: ErrorDetail {
                code: err.code().to_string(),
                message: err.to_string(),
                retryable: err.retryable(),
                blocked_until,
            },
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<RagError>() {
            Ok(rag) => rag.into(),
            Err(other) => RagError::storage(format!("{:#}", other)).into(),
        }
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        detail: ErrorDetail {
            code: "not_found".to_string(),
            message: message.into(),
            retryable: false,
            blocked_until: None,
        },
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /chat ============

/// Answer one question. Blocked sessions get `429`, invalid input `400`,
/// an unavailable completer without fallback `503`.
async fn handle_chat(
    State(ctx): State<AppContext>,
    Json(request): Json<AnswerRequest>,
) -> Result<Json<Answer>, AppError> {
    let answer = ctx.orchestrator.answer(&request).await?;
    Ok(Json(answer))
}

// ============ POST /ingest ============

#[derive(Serialize)]
struct IngestResponse {
    source: String,
    chunks: usize,
}

async fn handle_ingest(
    State(ctx): State<AppContext>,
    Json(request): Json<IngestRequest>,
) -> Result<Json<IngestResponse>, AppError> {
    let chunks = ctx.index.ingest(&request).await?;
    Ok(Json(IngestResponse {
        source: request.source.trim().to_string(),
        chunks,
    }))
}

// ============ POST /search ============

#[derive(Deserialize)]
struct SearchRequest {
    query: String,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    threshold: Option<f32>,
    #[serde(default)]
    doc_type: Option<String>,
}

#[derive(Serialize)]
struct SearchResponse {
    results: Vec<SearchResult>,
}

async fn handle_search(
    State(ctx): State<AppContext>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, AppError> {
    if request.query.trim().is_empty() {
        return Err(RagError::invalid("query must not be empty").into());
    }
    let mut params = ctx.config.retrieval.search_params();
    if let Some(limit) = request.limit {
        if limit == 0 {
            return Err(RagError::invalid("limit must be at least 1").into());
        }
        params.limit = ctx.config.retrieval.clamp_limit(limit);
    }
    if let Some(threshold) = request.threshold {
        params.threshold = threshold;
    }
    if request.doc_type.is_some() {
        params.doc_type = request.doc_type;
    }

    let results = ctx.index.search_text(&request.query, &params).await;
    Ok(Json(SearchResponse { results }))
}

// ============ /sessions/{id} ============

async fn handle_session(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Result<Json<SessionView>, AppError> {
    let policy = ctx.config.session.policy();
    sessions::show_session(ctx.sessions.as_ref(), ctx.turns.as_ref(), &policy, &id)
        .await?
        .map(Json)
        .ok_or_else(|| not_found(format!("no session with id: {}", id)))
}

#[derive(Deserialize)]
struct HistoryQuery {
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Serialize)]
struct HistoryResponse {
    session_id: String,
    turns: Vec<ConversationTurn>,
}

async fn handle_history(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, AppError> {
    validate_session_id(&id)?;
    if ctx.sessions.get_session(&id).await?.is_none() {
        return Err(not_found(format!("no session with id: {}", id)));
    }
    let turns = sessions::session_history(ctx.turns.as_ref(), &id, query.limit.unwrap_or(0)).await?;
    Ok(Json(HistoryResponse {
        session_id: id,
        turns,
    }))
}

async fn handle_reset(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Result<Json<SessionView>, AppError> {
    validate_session_id(&id)?;
    let policy = ctx.config.session.policy();
    if ctx.sessions.get_session(&id).await?.is_none() {
        return Err(not_found(format!("no session with id: {}", id)));
    }
    let view = sessions::reset_session(ctx.sessions.as_ref(), ctx.turns.as_ref(), &policy, &id).await?;
    Ok(Json(view))
}

// ============ GET /cache/stats ============

async fn handle_cache_stats(State(ctx): State<AppContext>) -> Result<Json<CacheStats>, AppError> {
    Ok(Json(ctx.cache.stats().await?))
}
