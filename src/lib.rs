//! # Tutor RAG
//!
//! Retrieval-augmented tutoring chat: lesson material is chunked, embedded
//! and stored; each learner question is answered from the most similar
//! chunks, the recent conversation and the learner's editor state, under a
//! per-session attempt throttle.
//!
//! ## Architecture
//!
//! ```text
//!  ingest ─▶ chunk ─▶ ┌────────────────┐ ─▶ ┌──────────┐
//!                     │ EmbeddingCache │    │  SQLite   │
//!  answer ─▶ embed ─▶ └────────────────┘    │ chunks    │
//!     │                                     │ cache     │
//!     ├─▶ session throttle ◀──────────────▶ │ sessions  │
//!     ├─▶ search (exact | flat) ◀────────── │ turns     │
//!     └─▶ prompt ─▶ completer ─▶ turns ───▶ └──────────┘
//!
//!                ┌──────────┐       ┌──────────┐
//!                │   CLI    │       │   HTTP   │
//!                │ (tutor)  │       │  (axum)  │
//!                └──────────┘       └──────────┘
//! ```
//!
//! Domain types, the store traits, chunking, similarity ranking, the session
//! state machine and prompt assembly live in the runtime-free
//! [`tutor_rag_core`] crate. This crate supplies the I/O around them.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`logging`] | Tracing subscriber setup |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite implementation of the store traits |
//! | [`embedding`] | Embedding providers |
//! | [`completion`] | Completion providers |
//! | [`cache`] | Single-flight embedding cache |
//! | [`search`] | Document index and retrieval |
//! | [`ingest`] | Document ingestion |
//! | [`chat`] | The answer orchestrator |
//! | [`sessions`] | Session administration and history |
//! | [`context`] | Component wiring |
//! | [`server`] | HTTP server |

pub mod cache;
pub mod chat;
pub mod completion;
pub mod config;
pub mod context;
pub mod db;
pub mod embedding;
pub mod ingest;
pub mod logging;
pub mod migrate;
pub mod search;
pub mod server;
pub mod sessions;
pub mod sqlite_store;
