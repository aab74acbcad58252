//! Deterministic offline embedding model.

use super::EmbeddingModel;
use crate::error::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Bag-of-words hashing embedder.
///
/// Each lowercase word is hashed into one of `dimension` buckets and the
/// vector is L2-normalized, so texts sharing words score a higher cosine
/// similarity. Needs no network; used by tests and demos. Counts calls so
/// cache behavior can be asserted.
#[derive(Debug)]
pub struct HashEmbedding {
    model_id: String,
    dimension: usize,
    batch_calls: AtomicUsize,
    texts_embedded: AtomicUsize,
}

impl HashEmbedding {
    /// Create a model producing vectors of `dimension` (minimum 1).
    pub fn new(dimension: usize) -> Self {
        let dimension = dimension.max(1);
        Self {
            model_id: format!("hash-{}", dimension),
            dimension,
            batch_calls: AtomicUsize::new(0),
            texts_embedded: AtomicUsize::new(0),
        }
    }

    pub fn with_model_id(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = model_id.into();
        self
    }

    /// Number of `embed_batch` calls so far.
    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    /// Total texts embedded across all calls.
    pub fn texts_embedded(&self) -> usize {
        self.texts_embedded.load(Ordering::SeqCst)
    }

    /// Embed synchronously. Same text, same vector.
    pub fn vector(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dimension];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let digest = Sha256::digest(word.to_lowercase().as_bytes());
            let mut bucket = [0u8; 8];
            bucket.copy_from_slice(&digest[..8]);
            let idx = (u64::from_le_bytes(bucket) % self.dimension as u64) as usize;
            v[idx] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }
}

#[async_trait]
impl EmbeddingModel for HashEmbedding {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> Option<usize> {
        Some(self.dimension)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        self.texts_embedded.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(texts.iter().map(|t| self.vector(t)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::similarity::cosine_similarity;

    #[test]
    fn test_deterministic_and_normalized() {
        let model = HashEmbedding::new(64);
        let a = model.vector("The cat sat");
        assert_eq!(a, model.vector("the CAT sat"));
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_shared_words_score_higher() {
        let model = HashEmbedding::new(256);
        let query = model.vector("weather forecast tomorrow");
        let related = model.vector("what is the weather forecast");
        let unrelated = model.vector("compile rust code");
        let near = cosine_similarity(&query, &related).unwrap();
        let far = cosine_similarity(&query, &unrelated).unwrap();
        assert!(near > far);
    }

    #[test]
    fn test_empty_text_is_zero_vector() {
        let model = HashEmbedding::new(8);
        assert!(model.vector("  ").iter().all(|x| *x == 0.0));
    }

    #[tokio::test]
    async fn test_counts_calls() {
        let model = HashEmbedding::new(8);
        model.embed_batch(&["a".into(), "b".into()]).await.unwrap();
        model.embed("c").await.unwrap();
        assert_eq!(model.batch_calls(), 2);
        assert_eq!(model.texts_embedded(), 3);
    }
}
