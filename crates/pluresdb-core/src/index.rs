//! In-memory vector index.
//!
//! A flat map from record id to its vector, scanned in full on every
//! query. Exact, supports removal, and stays byte-coherent with the store
//! (an ANN structure would trade both away for speed). The store rebuilds
//! it from the persistence backend on open.

use std::cmp::Ordering;

use dashmap::DashMap;

use crate::record::NodeId;

/// Cosine similarity with defensive length alignment: both vectors are
/// truncated to the shorter length, and degenerate results (zero norms,
/// non-finite scores) yield `None` so callers can exclude them.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    let len = a.len().min(b.len());
    if len == 0 {
        return None;
    }
    let (a, b) = (&a[..len], &b[..len]);
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    let score = dot / (norm_a * norm_b);
    score.is_finite().then_some(score)
}

/// Mapping from record id to its vector, answering top-k queries.
#[derive(Default)]
pub struct VectorIndex {
    vectors: DashMap<NodeId, Vec<f32>>,
}

impl std::fmt::Debug for VectorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorIndex")
            .field("indexed_nodes", &self.vectors.len())
            .finish()
    }
}

impl VectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any prior vector for `id`.
    pub fn upsert(&self, id: &str, vector: Vec<f32>) {
        self.vectors.insert(id.to_string(), vector);
    }

    /// Deletes any prior vector for `id`.
    pub fn remove(&self, id: &str) {
        self.vectors.remove(id);
    }

    pub fn has(&self, id: &str) -> bool {
        self.vectors.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Returns up to `k` ids with the highest cosine similarity to the
    /// query, highest first; score ties order by id so results are stable.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(NodeId, f32)> {
        if k == 0 || query.is_empty() {
            return Vec::new();
        }
        let mut scored: Vec<(NodeId, f32)> = self
            .vectors
            .iter()
            .filter_map(|entry| {
                cosine_similarity(query, entry.value())
                    .map(|score| (entry.key().clone(), score))
            })
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(k);
        scored
    }
}
