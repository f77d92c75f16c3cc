// src/embeddings/local.rs
// Deterministic local hashing embedder for offline and test operation

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Local feature-hashing embedder.
///
/// Tokens and character trigrams are hashed into a fixed-dimension bucket
/// vector. Not a semantic model, but deterministic, dependency-free, and
/// good enough for overlap-based similarity: texts sharing words and word
/// fragments land near each other.
pub struct LocalEmbeddings {
    dimensions: usize,
}

/// Weight of a whole-token feature relative to a trigram feature.
const TOKEN_WEIGHT: f32 = 1.0;
const TRIGRAM_WEIGHT: f32 = 0.5;

impl LocalEmbeddings {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(8),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Embed a single text. Empty text maps to a fixed unit vector.
    pub fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        let mut any = false;

        for token in tokenize(text) {
            any = true;
            self.accumulate(&mut vector, &token, TOKEN_WEIGHT);
            let chars: Vec<char> = token.chars().collect();
            if chars.len() > 3 {
                for window in chars.windows(3) {
                    let trigram: String = window.iter().collect();
                    self.accumulate(&mut vector, &trigram, TRIGRAM_WEIGHT);
                }
            }
        }

        if !any {
            vector[0] = 1.0;
        }
        vector
    }

    pub fn embed_batch(&self, texts: &[String]) -> Vec<Vec<f32>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    fn accumulate(&self, vector: &mut [f32], feature: &str, weight: f32) {
        // DefaultHasher::new() uses fixed keys, so buckets are stable
        // across processes and runs.
        let mut hasher = DefaultHasher::new();
        feature.hash(&mut hasher);
        let h = hasher.finish();
        let bucket = (h % self.dimensions as u64) as usize;
        // Sign bit from a higher hash bit spreads mass over both signs,
        // which keeps unrelated texts close to orthogonal.
        let sign = if (h >> 32) & 1 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign * weight;
    }
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
        dot / (na * nb)
    }

    #[test]
    fn test_deterministic() {
        let embedder = LocalEmbeddings::new(256);
        assert_eq!(embedder.embed("hello world"), embedder.embed("hello world"));
    }

    #[test]
    fn test_similar_texts_score_higher() {
        let embedder = LocalEmbeddings::new(256);
        let auth = embedder.embed("implemented jwt auth with refresh tokens");
        let query = embedder.embed("how did I implement auth");
        let unrelated = embedder.embed("grocery list milk eggs bread");
        assert!(cosine(&auth, &query) > cosine(&auth, &unrelated));
    }

    #[test]
    fn test_empty_text_is_nonzero() {
        let embedder = LocalEmbeddings::new(64);
        let v = embedder.embed("");
        assert!(v.iter().any(|x| *x != 0.0));
    }

    #[test]
    fn test_minimum_dimension_clamped() {
        let embedder = LocalEmbeddings::new(2);
        assert_eq!(embedder.dimensions(), 8);
    }
}
