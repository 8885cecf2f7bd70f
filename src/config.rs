//! TOML configuration.
//!
//! Every section except `[db]` is optional and every key has a default, so
//! a config file can be as small as:
//!
//! ```toml
//! [db]
//! path = "./data/tutor.sqlite"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use tutor_rag_core::prompt::PromptLimits;
use tutor_rag_core::search::SearchParams;
use tutor_rag_core::session::ThrottlePolicy;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_overlap_chars")]
    pub overlap_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
            overlap_chars: default_overlap_chars(),
        }
    }
}

fn default_max_chars() -> usize {
    1000
}
fn default_overlap_chars() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embedding_timeout_secs")]
    pub timeout_secs: u64,
    /// Cache entries unused for longer than this are evicted.
    #[serde(default)]
    pub max_age_days: Option<u32>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: default_embedding_model(),
            dims: default_dims(),
            base_url: default_openai_base_url(),
            max_retries: default_max_retries(),
            timeout_secs: default_embedding_timeout_secs(),
            max_age_days: None,
        }
    }
}

fn default_embedding_provider() -> String {
    "disabled".to_string()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_dims() -> usize {
    384
}
fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_max_retries() -> u32 {
    3
}
fn default_embedding_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// `exact` (store scan) or `flat` (in-process index).
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_threshold")]
    pub threshold: f32,
    #[serde(default)]
    pub doc_type: Option<String>,
    /// Upper bound on a caller-supplied search limit.
    #[serde(default = "default_max_limit")]
    pub max_limit: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            top_k: default_top_k(),
            threshold: default_threshold(),
            doc_type: None,
            max_limit: default_max_limit(),
        }
    }
}

impl RetrievalConfig {
    pub fn search_params(&self) -> SearchParams {
        SearchParams {
            limit: self.top_k,
            threshold: self.threshold,
            doc_type: self.doc_type.clone(),
        }
    }

    /// Cap a requested result count at `max_limit`.
    pub fn clamp_limit(&self, limit: usize) -> usize {
        limit.min(self.max_limit)
    }
}

fn default_backend() -> String {
    "exact".to_string()
}
fn default_top_k() -> usize {
    5
}
fn default_threshold() -> f32 {
    0.3
}
fn default_max_limit() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct CompletionConfig {
    #[serde(default = "default_completion_provider")]
    pub provider: String,
    #[serde(default = "default_completion_model")]
    pub model: String,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_completion_timeout_secs")]
    pub timeout_secs: u64,
    /// Answer with the offline reply instead of failing when the
    /// provider errors (timeouts always fail).
    #[serde(default = "default_true")]
    pub fallback_on_error: bool,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            provider: default_completion_provider(),
            model: default_completion_model(),
            base_url: default_openai_base_url(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout_secs: default_completion_timeout_secs(),
            fallback_on_error: true,
        }
    }
}

fn default_completion_provider() -> String {
    "offline".to_string()
}
fn default_completion_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_max_tokens() -> u32 {
    800
}
fn default_temperature() -> f32 {
    0.7
}
fn default_completion_timeout_secs() -> u64 {
    60
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    /// `false` allows unlimited questions.
    #[serde(default = "default_true")]
    pub throttle_enabled: bool,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_block_minutes")]
    pub block_minutes: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            throttle_enabled: true,
            max_attempts: default_max_attempts(),
            block_minutes: default_block_minutes(),
        }
    }
}

impl SessionConfig {
    pub fn policy(&self) -> ThrottlePolicy {
        ThrottlePolicy {
            enabled: self.throttle_enabled,
            max_attempts: self.max_attempts,
            block_duration: chrono::Duration::minutes(self.block_minutes),
        }
    }
}

fn default_max_attempts() -> u32 {
    20
}
fn default_block_minutes() -> i64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
    #[serde(default = "default_question_history")]
    pub question_history: usize,
    #[serde(default = "default_max_question_chars")]
    pub max_question_chars: usize,
    #[serde(default = "default_chunk_excerpt_chars")]
    pub chunk_excerpt_chars: usize,
    #[serde(default = "default_history_turn_chars")]
    pub history_turn_chars: usize,
    #[serde(default = "default_editor_code_chars")]
    pub editor_code_chars: usize,
    #[serde(default = "default_editor_text_chars")]
    pub instructions_chars: usize,
    #[serde(default = "default_editor_text_chars")]
    pub feedback_chars: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            history_turns: default_history_turns(),
            question_history: default_question_history(),
            max_question_chars: default_max_question_chars(),
            chunk_excerpt_chars: default_chunk_excerpt_chars(),
            history_turn_chars: default_history_turn_chars(),
            editor_code_chars: default_editor_code_chars(),
            instructions_chars: default_editor_text_chars(),
            feedback_chars: default_editor_text_chars(),
        }
    }
}

impl ChatConfig {
    pub fn prompt_limits(&self) -> PromptLimits {
        PromptLimits {
            chunk_excerpt_chars: self.chunk_excerpt_chars,
            history_turn_chars: self.history_turn_chars,
            editor_code_chars: self.editor_code_chars,
            instructions_chars: self.instructions_chars,
            feedback_chars: self.feedback_chars,
        }
    }
}

fn default_history_turns() -> usize {
    5
}
fn default_question_history() -> usize {
    10
}
fn default_max_question_chars() -> usize {
    4000
}
fn default_chunk_excerpt_chars() -> usize {
    600
}
fn default_history_turn_chars() -> usize {
    500
}
fn default_editor_text_chars() -> usize {
    2000
}
fn default_editor_code_chars() -> usize {
    4000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: default_bind() }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7340".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Also write a daily rolling log file here.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

impl Config {
    /// All-defaults config rooted at `db_path`.
    pub fn minimal(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            retrieval: RetrievalConfig::default(),
            completion: CompletionConfig::default(),
            session: SessionConfig::default(),
            chat: ChatConfig::default(),
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunking.max_chars == 0 {
            anyhow::bail!("chunking.max_chars must be > 0");
        }
        if self.chunking.overlap_chars >= self.chunking.max_chars {
            anyhow::bail!(
                "chunking.overlap_chars ({}) must be < chunking.max_chars ({})",
                self.chunking.overlap_chars,
                self.chunking.max_chars
            );
        }

        if self.embedding.dims == 0 {
            anyhow::bail!("embedding.dims must be > 0");
        }
        match self.embedding.provider.as_str() {
            "disabled" | "openai" => {}
            other => anyhow::bail!(
                "Unknown embedding provider: '{}'. Must be disabled or openai.",
                other
            ),
        }

        if self.retrieval.top_k < 1 {
            anyhow::bail!("retrieval.top_k must be >= 1");
        }
        if self.retrieval.max_limit < self.retrieval.top_k {
            anyhow::bail!(
                "retrieval.max_limit ({}) must be >= retrieval.top_k ({})",
                self.retrieval.max_limit,
                self.retrieval.top_k
            );
        }
        if !(-1.0..=1.0).contains(&self.retrieval.threshold) {
            anyhow::bail!("retrieval.threshold must be in [-1.0, 1.0]");
        }
        match self.retrieval.backend.as_str() {
            "exact" | "flat" => {}
            other => anyhow::bail!(
                "Unknown retrieval backend: '{}'. Must be exact or flat.",
                other
            ),
        }

        match self.completion.provider.as_str() {
            "offline" | "openai" => {}
            other => anyhow::bail!(
                "Unknown completion provider: '{}'. Must be offline or openai.",
                other
            ),
        }

        if self.session.max_attempts < 1 {
            anyhow::bail!("session.max_attempts must be >= 1");
        }
        if self.session.block_minutes < 0 {
            anyhow::bail!("session.block_minutes must be >= 0");
        }
        if self.chat.max_question_chars == 0 {
            anyhow::bail!("chat.max_question_chars must be > 0");
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_src: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_src)?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn test_minimal_file_gets_defaults() {
        let config = parse("[db]\npath = \"x.sqlite\"\n").unwrap();
        assert_eq!(config.chunking.max_chars, 1000);
        assert_eq!(config.chunking.overlap_chars, 200);
        assert_eq!(config.embedding.dims, 384);
        assert!(!config.embedding.is_enabled());
        assert_eq!(config.retrieval.backend, "exact");
        assert_eq!(config.completion.provider, "offline");
        assert!(config.session.throttle_enabled);
        assert_eq!(config.session.max_attempts, 20);
        assert_eq!(config.chat.question_history, 10);
    }

    #[test]
    fn test_overlap_must_be_smaller_than_window() {
        let err = parse("[db]\npath = \"x\"\n[chunking]\nmax_chars = 100\noverlap_chars = 100\n")
            .unwrap_err();
        assert!(err.to_string().contains("overlap_chars"));
    }

    #[test]
    fn test_unknown_names_rejected() {
        assert!(parse("[db]\npath = \"x\"\n[retrieval]\nbackend = \"hnsw\"\n").is_err());
        assert!(parse("[db]\npath = \"x\"\n[embedding]\nprovider = \"local\"\n").is_err());
        assert!(parse("[db]\npath = \"x\"\n[completion]\nprovider = \"magic\"\n").is_err());
    }

    #[test]
    fn test_threshold_range() {
        assert!(parse("[db]\npath = \"x\"\n[retrieval]\nthreshold = 1.5\n").is_err());
        assert!(parse("[db]\npath = \"x\"\n[retrieval]\nthreshold = -1.0\n").is_ok());
    }

    #[test]
    fn test_search_limit_is_capped() {
        let config = parse("[db]\npath = \"x\"\n[retrieval]\nmax_limit = 20\n").unwrap();
        assert_eq!(config.retrieval.clamp_limit(3), 3);
        assert_eq!(config.retrieval.clamp_limit(usize::MAX), 20);
        assert!(parse("[db]\npath = \"x\"\n[retrieval]\ntop_k = 10\nmax_limit = 5\n").is_err());
    }

    #[test]
    fn test_minimal_config_validates() {
        Config::minimal("/tmp/t.sqlite").validate().unwrap();
    }
}
