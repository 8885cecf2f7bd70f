//! In-process flat vector index.
//!
//! Holds every chunk with its vector norm precomputed and selects the
//! top-K with a bounded min-heap instead of sorting all candidates.
//! Scores are computed with the same arithmetic as
//! [`cosine_similarity`](crate::embedding::cosine_similarity), so rankings
//! match [`rank_by_similarity`](crate::search::rank_by_similarity) exactly,
//! including the ingestion-order tie-break.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use crate::embedding::{cosine_with_norms, l2_norm};
use crate::models::{Chunk, SearchResult};
use crate::search::{matches_type, SearchParams};

struct Entry {
    chunk: Chunk,
    norm: f32,
}

/// Heap key: higher score wins, then lower ordinal.
#[derive(Debug, Clone, Copy)]
struct Ranked {
    score: f32,
    ordinal: usize,
}

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ranked {}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.ordinal.cmp(&self.ordinal))
    }
}

/// Exact top-K index over pre-normed vectors.
#[derive(Default)]
pub struct FlatIndex {
    entries: Vec<Entry>,
}

impl FlatIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from chunks given in ingestion order.
    pub fn from_chunks<I: IntoIterator<Item = Chunk>>(chunks: I) -> Self {
        let mut index = Self::new();
        for chunk in chunks {
            index.insert(chunk);
        }
        index
    }

    /// Append a chunk; later inserts rank after earlier ones on ties.
    pub fn insert(&mut self, chunk: Chunk) {
        let norm = l2_norm(&chunk.embedding);
        self.entries.push(Entry { chunk, norm });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn search(&self, query: &[f32], params: &SearchParams) -> Vec<SearchResult> {
        if params.limit == 0 {
            return Vec::new();
        }
        let query_norm = l2_norm(query);
        let capacity = params.limit.min(self.entries.len()).saturating_add(1);
        let mut heap: BinaryHeap<Reverse<Ranked>> = BinaryHeap::with_capacity(capacity);

        for (ordinal, entry) in self.entries.iter().enumerate() {
            if !matches_type(&entry.chunk, params.doc_type.as_deref()) {
                continue;
            }
            let score = cosine_with_norms(query, query_norm, &entry.chunk.embedding, entry.norm);
            if score <= params.threshold {
                continue;
            }
            heap.push(Reverse(Ranked { score, ordinal }));
            if heap.len() > params.limit {
                heap.pop();
            }
        }

        // Ascending order of Reverse<_> is best-first.
        heap.into_sorted_vec()
            .into_iter()
            .map(|Reverse(r)| SearchResult {
                chunk: self.entries[r.ordinal].chunk.clone(),
                similarity_score: r.score,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::pseudo_embedding;
    use crate::search::rank_by_similarity;
    use crate::search::tests::make_chunk;

    fn corpus() -> Vec<Chunk> {
        let mut chunks: Vec<Chunk> = (0..60)
            .map(|i| {
                let doc_type = if i % 3 == 0 { "faq" } else { "lesson" };
                make_chunk(
                    &format!("c{}", i),
                    doc_type,
                    pseudo_embedding(&format!("chunk text {}", i % 25), "m", 16),
                )
            })
            .collect();
        chunks.push(make_chunk("zero", "lesson", vec![0.0; 16]));
        chunks.push(make_chunk("short", "lesson", vec![1.0; 4]));
        chunks
    }

    #[test]
    fn test_matches_brute_force() {
        let chunks = corpus();
        let index = FlatIndex::from_chunks(chunks.clone());
        let query = pseudo_embedding("chunk text 7", "m", 16);

        for (limit, threshold, doc_type) in [
            (5, 0.0, None),
            (10, -1.0, None),
            (100, 0.2, Some("lesson")),
            (3, 0.9, None),
            (7, -0.5, Some("faq")),
        ] {
            let params = SearchParams {
                limit,
                threshold,
                doc_type: doc_type.map(str::to_string),
            };
            let expected = rank_by_similarity(&query, chunks.clone(), &params);
            let actual = index.search(&query, &params);
            let ids = |r: &[SearchResult]| {
                r.iter()
                    .map(|x| (x.chunk.id.clone(), x.similarity_score))
                    .collect::<Vec<_>>()
            };
            assert_eq!(ids(&actual), ids(&expected), "params {:?}", params);
        }
    }

    #[test]
    fn test_duplicates_rank_by_insertion() {
        let query = pseudo_embedding("chunk text 7", "m", 16);
        let index = FlatIndex::from_chunks(corpus());
        let params = SearchParams {
            limit: 3,
            threshold: 0.99,
            doc_type: None,
        };
        let ids: Vec<String> = index
            .search(&query, &params)
            .into_iter()
            .map(|r| r.chunk.id)
            .collect();
        assert_eq!(ids, vec!["c7", "c32", "c57"]);
    }

    #[test]
    fn test_huge_limit_returns_every_match() {
        let chunks = corpus();
        let index = FlatIndex::from_chunks(chunks.clone());
        let query = pseudo_embedding("chunk text 7", "m", 16);

        for limit in [1usize << 40, usize::MAX] {
            let params = SearchParams {
                limit,
                threshold: -1.0,
                doc_type: None,
            };
            let results = index.search(&query, &params);
            assert_eq!(results, rank_by_similarity(&query, chunks.clone(), &params));
            // Zero and short vectors score 0 and still clear -1.0.
            assert_eq!(results.len(), chunks.len());
        }
    }

    #[test]
    fn test_clear() {
        let mut index = FlatIndex::from_chunks(corpus());
        assert!(!index.is_empty());
        index.clear();
        assert_eq!(index.len(), 0);
        assert!(index.search(&[1.0], &SearchParams::default()).is_empty());
    }
}
