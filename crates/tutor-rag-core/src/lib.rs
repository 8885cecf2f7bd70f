//! # Tutor RAG Core
//!
//! Shared, runtime-free logic for the tutoring chat pipeline: data models,
//! chunking, vector math, similarity ranking, the session throttle state
//! machine, progress tracking, prompt assembly, collaborator traits, and
//! the storage abstraction.
//!
//! This crate contains no tokio, sqlx, network, or filesystem I/O. The
//! application crate supplies concrete stores and providers.

pub mod chunk;
pub mod completion;
pub mod embedding;
pub mod error;
pub mod index;
pub mod models;
pub mod progress;
pub mod prompt;
pub mod search;
pub mod session;
pub mod store;

pub use error::RagError;
