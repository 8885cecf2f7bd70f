//! Embedder trait and vector utilities.
//!
//! Defines the [`Embedder`] collaborator interface plus pure helpers for
//! vector serialization, similarity, content hashing, and the
//! deterministic pseudo-embeddings used when no live backend exists.
//!
//! Concrete providers (OpenAI, pseudo) live in the `tutor-rag` app crate.

use anyhow::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::chunk::normalize_whitespace;

/// Computes a vector for a text + model pair.
///
/// Implementations must be safely retryable.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Returns the default model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;
    /// `false` for offline stand-ins that never reach a real backend.
    fn is_live(&self) -> bool {
        true
    }
    /// Embed one text with the given model.
    async fn embed(&self, text: &str, model: &str) -> Result<Vec<f32>>;
}

/// SHA-256 (hex) of the whitespace-normalized text.
///
/// This is the content address used by the embedding cache.
pub fn text_digest(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_whitespace(text).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Deterministic, L2-normalized stand-in vector for `text` under `model`.
///
/// Same inputs always give the same vector; different texts give different
/// vectors. Components are drawn from SHA-256 blocks of
/// `(model, normalized text, block index)` mapped into `[-1, 1]`.
pub fn pseudo_embedding(text: &str, model: &str, dims: usize) -> Vec<f32> {
    let normalized = normalize_whitespace(text);
    let mut out = Vec::with_capacity(dims);
    let mut block: u32 = 0;

    while out.len() < dims {
        let mut hasher = Sha256::new();
        hasher.update(model.as_bytes());
        hasher.update([0u8]);
        hasher.update(normalized.as_bytes());
        hasher.update(block.to_le_bytes());
        let digest = hasher.finalize();

        for pair in digest.chunks_exact(2) {
            if out.len() == dims {
                break;
            }
            let raw = u16::from_le_bytes([pair[0], pair[1]]) as f32;
            out.push(raw / (u16::MAX as f32) * 2.0 - 1.0);
        }
        block += 1;
    }

    normalize(&mut out);
    out
}

/// Scale `v` to unit length in place. Zero vectors are left untouched.
pub fn normalize(v: &mut [f32]) {
    let norm = l2_norm(v);
    if norm < f32::EPSILON {
        return;
    }
    for x in v.iter_mut() {
        *x /= norm;
    }
}

/// Euclidean length of `v`.
pub fn l2_norm(v: &[f32]) -> f32 {
    let mut sum = 0.0f32;
    for x in v {
        sum += x * x;
    }
    sum.sqrt()
}

/// Dot product; callers guarantee equal lengths.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    let mut sum = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        sum += x * y;
    }
    sum
}

/// Cosine similarity from precomputed norms.
///
/// Shared by [`cosine_similarity`] and the flat index so both produce
/// bit-identical scores.
pub fn cosine_with_norms(a: &[f32], norm_a: f32, b: &[f32], norm_b: f32) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let denom = norm_a * norm_b;
    if denom < f32::EPSILON {
        return 0.0;
    }
    // Rounding can land just outside [-1, 1].
    (dot(a, b) / denom).clamp(-1.0, 1.0)
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`:
/// - `1.0` = identical direction
/// - `0.0` = orthogonal (unrelated)
/// - `-1.0` = opposite direction
///
/// Returns `0.0` for empty vectors, zero vectors, or vectors of
/// different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    cosine_with_norms(a, l2_norm(a), b, l2_norm(b))
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
