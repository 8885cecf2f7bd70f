//! Completion providers.
//!
//! - **[`OpenAICompleter`]** calls `POST {base_url}/chat/completions`.
//! - **[`OfflineCompleter`]** answers deterministically from the request
//!   itself, naming the detected topics and the top retrieved source.
//!
//! [`create_completer`] mirrors [`create_embedder`](crate::embedding::create_embedder):
//! a missing API key selects the offline variant instead of failing.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use tutor_rag_core::completion::{Completer, Completion, CompletionRequest};
use tutor_rag_core::progress::extract_topics;
use tutor_rag_core::prompt::estimate_tokens;

use crate::config::CompletionConfig;
use crate::embedding::{post_with_backoff, API_KEY_VAR};

// ============ Offline Completer ============

/// Canned-but-topical completer for running without credentials.
#[derive(Default)]
pub struct OfflineCompleter;

impl OfflineCompleter {
    /// Reply text for `request`; identical requests give identical replies.
    pub fn reply(request: &CompletionRequest) -> String {
        let question = request.last_user_message().unwrap_or_default();
        let topics = extract_topics(question);
        let source = request
            .messages
            .first()
            .filter(|m| m.role == "system")
            .and_then(|m| top_source(&m.content));

        let mut reply = String::from("The tutor is running in offline mode, so this is a general pointer rather than a full answer.");
        if !topics.is_empty() {
            reply.push_str(&format!(" Your question touches on: {}.", topics.join(", ")));
        }
        match source {
            Some(source) => reply.push_str(&format!(
                " The most relevant course material is '{}'; start by re-reading it.",
                source
            )),
            None => reply.push_str(" No matching course material was found, so try rephrasing or check the lesson instructions."),
        }
        reply
    }
}

/// Source id of the first retrieved chunk in a system prompt
/// (lines shaped like `[1] <source> (<type>, similarity …)`).
fn top_source(system: &str) -> Option<String> {
    system
        .lines()
        .find_map(|line| line.strip_prefix("[1] "))
        .and_then(|rest| rest.rsplit_once(" (").map(|(source, _)| source.to_string()))
}

#[async_trait]
impl Completer for OfflineCompleter {
    fn name(&self) -> &str {
        "offline"
    }
    fn is_fallback(&self) -> bool {
        true
    }
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let content = Self::reply(request);
        let tokens_used = estimate_tokens(&content);
        Ok(Completion {
            content,
            tokens_used,
        })
    }
}

// ============ OpenAI Completer ============

/// Completer backed by an OpenAI-compatible chat completions endpoint.
pub struct OpenAICompleter {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAICompleter {
    pub fn new(config: &CompletionConfig, api_key: String) -> Result<Self> {
        // The orchestrator enforces `timeout_secs`; this only guards
        // against a connection that never completes.
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.saturating_mul(2).max(1)))
            .build()?;

        Ok(Self {
            client,
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl Completer for OpenAICompleter {
    fn name(&self) -> &str {
        "openai"
    }
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": request.messages,
            "max_tokens": request.options.max_tokens,
            "temperature": request.options.temperature,
        });
        let url = format!("{}/chat/completions", self.base_url);
        let json = post_with_backoff(&self.client, &url, &self.api_key, &body, 0).await?;
        parse_completion_response(&json)
    }
}

fn parse_completion_response(json: &serde_json::Value) -> Result<Completion> {
    let content = json
        .pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .ok_or_else(|| anyhow::anyhow!("Invalid completion response: missing choices[0].message.content"))?
        .to_string();
    let tokens_used = json
        .pointer("/usage/total_tokens")
        .and_then(|t| t.as_u64())
        .map(|t| t as u32)
        .unwrap_or_else(|| estimate_tokens(&content));
    Ok(Completion {
        content,
        tokens_used,
    })
}

/// Create the configured [`Completer`].
pub fn create_completer(config: &CompletionConfig) -> Result<Arc<dyn Completer>> {
    match config.provider.as_str() {
        "offline" => Ok(Arc::new(OfflineCompleter)),
        "openai" => match std::env::var(API_KEY_VAR) {
            Ok(key) if !key.trim().is_empty() => Ok(Arc::new(OpenAICompleter::new(config, key)?)),
            _ => {
                warn!(
                    "{} not set; completion provider 'openai' falls back to offline replies",
                    API_KEY_VAR
                );
                Ok(Arc::new(OfflineCompleter))
            }
        },
        other => bail!("Unknown completion provider: {}", other),
    }
}
