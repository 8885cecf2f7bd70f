//! # Tutor CLI (`tutor`)
//!
//! The `tutor` binary drives the tutoring pipeline: database setup, lesson
//! ingestion, one-shot questions, retrieval debugging, session administration
//! and the HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! tutor --config ./config/tutor.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `tutor init` | Create the SQLite database and run schema migrations |
//! | `tutor ingest <path>` | Chunk, embed and store one document |
//! | `tutor ask <session> "<question>"` | Answer a question for a session |
//! | `tutor search "<query>"` | Similarity search over stored chunks |
//! | `tutor history <session>` | Print a session's conversation |
//! | `tutor session show\|reset\|block <id>` | Inspect or administer a session |
//! | `tutor cache stats\|evict` | Inspect or prune the embedding cache |
//! | `tutor chunks list\|clear` | List sources or remove every stored chunk |
//! | `tutor serve` | Start the HTTP server |
//!
//! ## Examples
//!
//! ```bash
//! tutor init
//! tutor ingest ./lessons/flexbox.md --doc-type lesson --meta lesson=3
//! tutor ask learner-42 "Why doesn't justify-content center my items?" \
//!     --code-file ./exercise.css
//! tutor session reset learner-42
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use tutor_rag::{cache, chat, config, ingest, logging, migrate, search, server, sessions};
use tutor_rag_core::models::EditorContext;

/// Tutor: retrieval-augmented answers for programming learners.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/tutor.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "tutor",
    about = "Tutor: retrieval-augmented tutoring chat over your lesson material",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/tutor.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Ingest one document from a file.
    ///
    /// The document is split into overlapping chunks, each chunk is embedded
    /// and stored. A source can only be ingested once; run `chunks clear`
    /// to start over.
    Ingest {
        /// File to read (UTF-8 text).
        path: PathBuf,

        /// Source label stored with every chunk. Defaults to the file stem.
        #[arg(long)]
        source: Option<String>,

        /// Document type, e.g. `lesson`, `reference`, `exercise`.
        #[arg(long, default_value = "lesson")]
        doc_type: String,

        /// Extra metadata as `key=value`; repeatable.
        #[arg(long = "meta")]
        meta: Vec<String>,
    },

    /// Ask one question on behalf of a session.
    Ask {
        /// Session identifier.
        session: String,

        /// The learner's question.
        question: String,

        /// File holding the learner's current code.
        #[arg(long)]
        code_file: Option<PathBuf>,

        /// Exercise instructions shown to the learner.
        #[arg(long)]
        instructions: Option<String>,
    },

    /// Search stored chunks by similarity to a query.
    Search {
        query: String,

        /// Maximum number of results (defaults to `retrieval.top_k`).
        #[arg(long)]
        limit: Option<usize>,

        /// Minimum similarity, exclusive (defaults to `retrieval.threshold`).
        #[arg(long)]
        threshold: Option<f32>,

        /// Only search chunks of this document type.
        #[arg(long)]
        doc_type: Option<String>,
    },

    /// Print a session's conversation, oldest first.
    History {
        session: String,

        /// Only the most recent N turns (0 = all).
        #[arg(long, default_value = "0")]
        limit: usize,
    },

    /// Inspect or administer a session.
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },

    /// Inspect or prune the embedding cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Manage stored chunks.
    Chunks {
        #[command(subcommand)]
        action: ChunksAction,
    },

    /// Start the HTTP server on `server.bind`.
    Serve,
}

#[derive(Subcommand)]
enum SessionAction {
    /// Show attempts, block state and progress.
    Show { id: String },
    /// Clear attempts and any block.
    Reset { id: String },
    /// Block a session (defaults to `session.block_minutes`).
    Block {
        id: String,
        #[arg(long)]
        minutes: Option<i64>,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Show whether the cache is enabled and how many entries it holds.
    Stats,
    /// Remove entries unused for more than N days
    /// (defaults to `embedding.max_age_days`).
    Evict {
        #[arg(long)]
        days: Option<u32>,
    },
}

#[derive(Subcommand)]
enum ChunksAction {
    /// List ingested sources with their chunk counts.
    List,
    /// Delete every stored chunk.
    Clear,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.logging);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest {
            path,
            source,
            doc_type,
            meta,
        } => {
            ingest::run_ingest(&cfg, &path, source, &doc_type, &meta).await?;
        }
        Commands::Ask {
            session,
            question,
            code_file,
            instructions,
        } => {
            let code = match code_file {
                Some(path) => Some(std::fs::read_to_string(&path).map_err(|e| {
                    anyhow::anyhow!("Failed to read {}: {}", path.display(), e)
                })?),
                None => None,
            };
            let editor = EditorContext {
                code,
                instructions,
                feedback: None,
            };
            let editor = (!editor.is_empty()).then_some(editor);
            chat::run_ask(&cfg, &session, &question, editor).await?;
        }
        Commands::Search {
            query,
            limit,
            threshold,
            doc_type,
        } => {
            search::run_search(&cfg, &query, limit, threshold, doc_type).await?;
        }
        Commands::History { session, limit } => {
            sessions::run_history(&cfg, &session, limit).await?;
        }
        Commands::Session { action } => match action {
            SessionAction::Show { id } => sessions::run_session_show(&cfg, &id).await?,
            SessionAction::Reset { id } => sessions::run_session_reset(&cfg, &id).await?,
            SessionAction::Block { id, minutes } => {
                sessions::run_session_block(&cfg, &id, minutes).await?
            }
        },
        Commands::Cache { action } => match action {
            CacheAction::Stats => cache::run_cache_stats(&cfg).await?,
            CacheAction::Evict { days } => cache::run_cache_evict(&cfg, days).await?,
        },
        Commands::Chunks { action } => match action {
            ChunksAction::List => search::run_list_sources(&cfg).await?,
            ChunksAction::Clear => search::run_clear(&cfg).await?,
        },
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
