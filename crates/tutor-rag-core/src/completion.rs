//! Completion collaborator contract.
//!
//! The language-model call is opaque to the pipeline: it receives an
//! ordered list of role-tagged messages plus sampling options and returns
//! text with a token count. Providers live in the app crate.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// `"system"`, `"user"`, or `"assistant"`.
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompletionOptions {
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            max_tokens: 800,
            temperature: 0.7,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub options: CompletionOptions,
}

impl CompletionRequest {
    /// Content of the last `user` message, if any.
    pub fn last_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub content: String,
    pub tokens_used: u32,
}

/// Text-completion collaborator.
#[async_trait]
pub trait Completer: Send + Sync {
    /// Provider name (e.g. `"openai"`, `"offline"`).
    fn name(&self) -> &str;

    /// `true` for the offline stand-in that answers without a model.
    fn is_fallback(&self) -> bool {
        false
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion>;
}
