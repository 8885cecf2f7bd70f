//! Brute-force cosine ranking: the reference search algorithm.
//!
//! Every store backend and accelerated index must agree with
//! [`rank_by_similarity`] for the same candidates, limit, and threshold.
//!
//! # Ranking
//!
//! 1. Optionally drop candidates whose document type differs from the filter.
//! 2. Score each candidate: `sim = (q · v) / (|q| |v|)`, `0` if either norm is 0.
//! 3. Keep only `sim > threshold`.
//! 4. Sort by `sim` descending; ties keep ingestion order.
//! 5. Truncate to `limit`.

use serde::{Deserialize, Serialize};

use crate::embedding::{cosine_with_norms, l2_norm};
use crate::models::{Chunk, SearchResult};

/// Retrieval parameters for a single search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchParams {
    /// Maximum results to return.
    pub limit: usize,
    /// Results must score strictly above this.
    pub threshold: f32,
    /// Only consider chunks of this document type.
    pub doc_type: Option<String>,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            limit: 5,
            threshold: 0.3,
            doc_type: None,
        }
    }
}

/// Rank `candidates` (given in ingestion order) against `query`.
pub fn rank_by_similarity<I>(query: &[f32], candidates: I, params: &SearchParams) -> Vec<SearchResult>
where
    I: IntoIterator<Item = Chunk>,
{
    if params.limit == 0 {
        return Vec::new();
    }

    let query_norm = l2_norm(query);
    let mut results: Vec<SearchResult> = candidates
        .into_iter()
        .filter(|c| matches_type(c, params.doc_type.as_deref()))
        .filter_map(|chunk| {
            let score = cosine_with_norms(query, query_norm, &chunk.embedding, l2_norm(&chunk.embedding));
            (score > params.threshold).then_some(SearchResult {
                chunk,
                similarity_score: score,
            })
        })
        .collect();

    // sort_by is stable, so equal scores keep ingestion order.
    results.sort_by(|a, b| b.similarity_score.total_cmp(&a.similarity_score));
    results.truncate(params.limit);
    results
}

/// Whether `chunk` passes an optional document-type filter.
pub fn matches_type(chunk: &Chunk, doc_type: Option<&str>) -> bool {
    doc_type.map_or(true, |t| chunk.document_type == t)
}
