//! Embedder providers.
//!
//! - **[`OpenAIEmbedder`]** calls `POST {base_url}/embeddings` with retry
//!   and backoff.
//! - **[`PseudoEmbedder`]** returns deterministic hash-derived vectors and
//!   never touches the network.
//!
//! Use [`create_embedder`] to pick one from configuration. An `openai`
//! provider without `OPENAI_API_KEY` falls back to the pseudo embedder
//! with a warning, so the pipeline stays usable offline.
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use tutor_rag_core::embedding::{pseudo_embedding, Embedder};

use crate::config::EmbeddingConfig;

/// Env var holding the API key for OpenAI-compatible endpoints.
pub const API_KEY_VAR: &str = "OPENAI_API_KEY";

/// POST `body` as JSON, retrying transient failures with exponential
/// backoff. Returns the parsed JSON body of the first 2xx response.
pub(crate) async fn post_with_backoff(
    client: &reqwest::Client,
    url: &str,
    api_key: &str,
    body: &serde_json::Value,
    max_retries: u32,
) -> Result<serde_json::Value> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            // Exponential backoff: 1s, 2s, 4s, 8s, ...
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            debug!(attempt, delay_secs = delay.as_secs(), url, "retrying request");
            tokio::time::sleep(delay).await;
        }

        let resp = client
            .post(url)
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await;

        match resp {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return Ok(response.json().await?);
                }

                // Rate limited or server error: retry
                if status.as_u16() == 429 || status.is_server_error() {
                    let body_text = response.text().await.unwrap_or_default();
                    last_err = Some(anyhow::anyhow!("API error {}: {}", status, body_text));
                    continue;
                }

                // Client error (not 429): fail now
                let body_text = response.text().await.unwrap_or_default();
                bail!("API error {}: {}", status, body_text);
            }
            Err(e) => {
                last_err = Some(e.into());
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("request failed after retries")))
}

// ============ Pseudo Embedder ============

/// Offline embedder producing deterministic, L2-normalized vectors.
pub struct PseudoEmbedder {
    model: String,
    dims: usize,
}

impl PseudoEmbedder {
    pub fn new(model: &str, dims: usize) -> Self {
        Self {
            model: model.to_string(),
            dims,
        }
    }
}

#[async_trait]
impl Embedder for PseudoEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    fn is_live(&self) -> bool {
        false
    }
    async fn embed(&self, text: &str, model: &str) -> Result<Vec<f32>> {
        Ok(pseudo_embedding(text, model, self.dims))
    }
}

// ============ OpenAI Embedder ============

/// Embedder backed by an OpenAI-compatible `/embeddings` endpoint.
pub struct OpenAIEmbedder {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    dims: usize,
    max_retries: u32,
}

impl OpenAIEmbedder {
    pub fn new(config: &EmbeddingConfig, api_key: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            dims: config.dims,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, text: &str, model: &str) -> Result<Vec<f32>> {
        let body = serde_json::json!({
            "model": model,
            "input": [text],
            // Keeps live vectors comparable with the pseudo fallback.
            "dimensions": self.dims,
        });
        let url = format!("{}/embeddings", self.base_url);
        let json = post_with_backoff(&self.client, &url, &self.api_key, &body, self.max_retries).await?;
        parse_embedding_response(&json)
    }
}

/// Extract `data[0].embedding` from an embeddings API response.
fn parse_embedding_response(json: &serde_json::Value) -> Result<Vec<f32>> {
    let embedding = json
        .get("data")
        .and_then(|d| d.as_array())
        .and_then(|d| d.first())
        .and_then(|item| item.get("embedding"))
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid embeddings response: missing data[0].embedding"))?;

    let vec: Vec<f32> = embedding
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect();
    if vec.is_empty() {
        bail!("Invalid embeddings response: empty vector");
    }
    Ok(vec)
}

/// Create the configured [`Embedder`].
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"disabled"` | [`PseudoEmbedder`] |
/// | `"openai"` | [`OpenAIEmbedder`], or [`PseudoEmbedder`] without an API key |
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(PseudoEmbedder::new(&config.model, config.dims))),
        "openai" => match std::env::var(API_KEY_VAR) {
            Ok(key) if !key.trim().is_empty() => Ok(Arc::new(OpenAIEmbedder::new(config, key)?)),
            _ => {
                warn!(
                    "{} not set; embedding provider 'openai' falls back to pseudo-embeddings",
                    API_KEY_VAR
                );
                Ok(Arc::new(PseudoEmbedder::new(&config.model, config.dims)))
            }
        },
        other => bail!("Unknown embedding provider: {}", other),
    }
}
