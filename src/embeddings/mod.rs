//! Text embedding models and cache-aware embedding.
//!
//! [`EmbeddingModel`] is the provider boundary; [`CachedEmbedder`] puts a
//! shared [`Cache`] in front of it so repeated content is embedded once per
//! model across runs and across concurrent pipelines.

pub mod mock;
pub mod ollama;

pub use mock::HashEmbedding;
pub use ollama::OllamaEmbedding;

use crate::cache::{Cache, CacheKey, CacheValue};
use crate::error::Result;
use crate::PipelineError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Text-to-vector model.
///
/// Implementations must be shareable across tasks (`Arc<dyn EmbeddingModel>`).
#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    /// Identifier mixed into cache keys, e.g. `"nomic-embed-text"`.
    fn model_id(&self) -> &str;

    /// Vector length, when known up front.
    fn dimension(&self) -> Option<usize> {
        None
    }

    /// Embed several texts in one call. Output order matches input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut out = self.embed_batch(&[text.to_string()]).await?;
        out.pop().ok_or_else(|| {
            PipelineError::Other(format!("{} returned no embedding", self.model_id()))
        })
    }
}

/// An [`EmbeddingModel`] with a cache in front of it.
///
/// Keys are `CacheKey::embedding(model_id, text)`, so two models never share
/// entries. Lookups that miss are sent to the model as one batch.
#[derive(Clone)]
pub struct CachedEmbedder {
    model: Arc<dyn EmbeddingModel>,
    cache: Arc<dyn Cache>,
    ttl: Option<Duration>,
}

impl CachedEmbedder {
    pub fn new(model: Arc<dyn EmbeddingModel>, cache: Arc<dyn Cache>) -> Self {
        Self {
            model,
            cache,
            ttl: None,
        }
    }

    /// Expire cached vectors after `ttl`.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn model(&self) -> &Arc<dyn EmbeddingModel> {
        &self.model
    }

    pub fn cache(&self) -> &Arc<dyn Cache> {
        &self.cache
    }

    /// Embed one text through the cache.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut out = self.embed_all(&[text.to_string()]).await?;
        out.pop()
            .ok_or_else(|| PipelineError::Other("embedding batch came back empty".into()))
    }

    /// Embed every text, consulting the cache first.
    ///
    /// Distinct misses are embedded in a single batch and written back.
    /// Concurrent callers racing on the same key may both compute it; the
    /// cache keeps one intact value either way.
    pub async fn embed_all(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let model_id = self.model.model_id();
        let mut out: Vec<Option<Vec<f32>>> = Vec::with_capacity(texts.len());
        let mut missing: Vec<String> = Vec::new();
        let mut waiting: HashMap<&str, Vec<usize>> = HashMap::new();

        for (idx, text) in texts.iter().enumerate() {
            let key = CacheKey::embedding(model_id, text);
            let hit = self
                .cache
                .get(&key)
                .and_then(|v| v.as_embedding().map(<[f32]>::to_vec));
            if hit.is_none() {
                let slots = waiting.entry(text.as_str()).or_default();
                if slots.is_empty() {
                    missing.push(text.clone());
                }
                slots.push(idx);
            }
            out.push(hit);
        }

        if !missing.is_empty() {
            tracing::debug!(
                model = model_id,
                requested = texts.len(),
                misses = missing.len(),
                "embedding cache misses"
            );
            let vectors = self.model.embed_batch(&missing).await?;
            if vectors.len() != missing.len() {
                return Err(PipelineError::Other(format!(
                    "{} returned {} embeddings for {} inputs",
                    model_id,
                    vectors.len(),
                    missing.len()
                )));
            }
            for (text, vector) in missing.iter().zip(vectors) {
                for &idx in waiting.get(text.as_str()).into_iter().flatten() {
                    out[idx] = Some(vector.clone());
                }
                self.cache.set(
                    CacheKey::embedding(model_id, text),
                    CacheValue::Embedding(vector),
                    self.ttl,
                );
            }
        }

        out.into_iter()
            .map(|v| v.ok_or_else(|| PipelineError::Other("embedding slot left unfilled".into())))
            .collect()
    }
}

impl std::fmt::Debug for CachedEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedEmbedder")
            .field("model", &self.model.model_id())
            .field("ttl", &self.ttl)
            .finish()
    }
}
