//! Idempotent schema creation.
//!
//! All statements use `IF NOT EXISTS`, so running migrations on every
//! start (and from `tutor init`) is safe. Timestamps are stored as Unix
//! milliseconds; vectors as little-endian f32 BLOBs; free-form maps as
//! JSON text.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index on an open pool.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    // `seq` gives a total ingestion order used as the ranking tie-break.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            source_id TEXT NOT NULL,
            document_type TEXT NOT NULL,
            raw_content TEXT NOT NULL,
            chunk_text TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            embedding BLOB NOT NULL,
            embedding_dimensions INTEGER NOT NULL,
            embedding_model TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE(source_id, chunk_index)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS embedding_cache (
            text_hash TEXT NOT NULL,
            model TEXT NOT NULL,
            vector BLOB NOT NULL,
            dimensions INTEGER NOT NULL,
            usage_count INTEGER NOT NULL DEFAULT 1,
            last_used_at INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (text_hash, model)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chat_sessions (
            session_id TEXT PRIMARY KEY,
            user_id TEXT,
            attempt_count INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL,
            is_blocked INTEGER NOT NULL DEFAULT 0,
            blocked_until INTEGER,
            last_activity INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            progress_json TEXT NOT NULL DEFAULT '{}',
            version INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS conversation_turns (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            turn_id TEXT NOT NULL UNIQUE,
            session_id TEXT NOT NULL,
            role TEXT NOT NULL CHECK (role IN ('user', 'assistant')),
            content TEXT NOT NULL,
            sent_at INTEGER NOT NULL,
            editor_json TEXT,
            chunk_refs_json TEXT,
            token_count INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_document_type ON chunks(document_type)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_source_id ON chunks(source_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_embedding_cache_last_used ON embedding_cache(last_used_at)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_turns_session_order ON conversation_turns(session_id, sent_at, seq)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
