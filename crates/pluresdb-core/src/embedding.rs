//! Text embedding for similarity search.
//!
//! The default embedder hashes text into a fixed 64-dimension vector. It is
//! deterministic across platforms and languages, which is what replication
//! needs: every peer derives the same vector from the same text. Callers
//! wanting semantic quality can pre-compute `data.vector` or attach their
//! own [`EmbedText`] backend.

use serde_json::Value as JsonValue;

/// Dimension of vectors produced by the default embedder.
pub const EMBEDDING_DIM: usize = 64;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// Pluggable text-embedding backend.
///
/// Attach an implementation to a store to replace the default hash
/// embedder, e.g. with a model-backed encoder. Embedding runs on a blocking
/// worker, so implementations may be arbitrarily expensive.
pub trait EmbedText: Send + Sync + std::fmt::Debug {
    /// Generate an embedding for a single text string.
    fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;

    /// Dimensionality of the embeddings produced by this backend.
    fn dimension(&self) -> usize;
}

/// Deterministic rolling-hash embedder.
///
/// An FNV-1a hash walks the UTF-16 code units of the input; each step
/// increments one bucket of a 64-element vector, which is then
/// L2-normalized. Empty input stays all-zero.
#[derive(Debug, Default, Clone, Copy)]
pub struct HashEmbedder;

impl HashEmbedder {
    pub fn embed_text(text: &str) -> Vec<f32> {
        let mut vector = vec![0.0_f32; EMBEDDING_DIM];
        let mut hash = FNV_OFFSET_BASIS;
        for unit in text.encode_utf16() {
            hash ^= u32::from(unit);
            hash = hash.wrapping_mul(FNV_PRIME);
            vector[hash as usize % EMBEDDING_DIM] += 1.0;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

impl EmbedText for HashEmbedder {
    fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        Ok(Self::embed_text(text))
    }

    fn dimension(&self) -> usize {
        EMBEDDING_DIM
    }
}

/// Pulls embeddable text out of a record payload: `text` first, then
/// `content`; anything else means there is nothing to embed.
pub(crate) fn embeddable_text(fields: &serde_json::Map<String, JsonValue>) -> Option<&str> {
    fields
        .get("text")
        .and_then(JsonValue::as_str)
        .or_else(|| fields.get("content").and_then(JsonValue::as_str))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_is_deterministic() {
        let a = HashEmbedder::embed_text("alpha");
        let b = HashEmbedder::embed_text("alpha");
        assert_eq!(a, b);
        assert_eq!(a.len(), EMBEDDING_DIM);
    }

    #[test]
    fn empty_text_embeds_to_zero_vector() {
        let v = HashEmbedder::embed_text("");
        assert!(v.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn non_empty_embedding_is_unit_length() {
        let v = HashEmbedder::embed_text("hello world");
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5, "norm was {norm}");
    }

    #[test]
    fn overlapping_texts_are_more_similar_than_disjoint_ones() {
        let alpha = HashEmbedder::embed_text("alpha");
        let alpha_beta = HashEmbedder::embed_text("alpha beta");
        let gamma = HashEmbedder::embed_text("gamma");

        let dot = |a: &[f32], b: &[f32]| -> f32 {
            a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
        };
        assert!(dot(&alpha, &alpha_beta) > dot(&alpha, &gamma));
    }

    #[test]
    fn embeddable_text_prefers_text_over_content() {
        let fields = serde_json::json!({"text": "primary", "content": "secondary"});
        let serde_json::Value::Object(fields) = fields else {
            unreachable!()
        };
        assert_eq!(embeddable_text(&fields), Some("primary"));
    }
}
