//! Embedding model backed by Ollama's `/api/embed` endpoint.

use super::EmbeddingModel;
use crate::backend::{normalize_base_url, post_json};
use crate::error::Result;
use crate::PipelineError;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// Ollama embedding model, e.g. `nomic-embed-text`.
#[derive(Debug, Clone)]
pub struct OllamaEmbedding {
    client: Client,
    base_url: String,
    model: String,
    dimension: Option<usize>,
}

impl OllamaEmbedding {
    pub fn new(base_url: impl AsRef<str>, model: impl Into<String>) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self::with_client(client, base_url, model))
    }

    pub fn with_client(
        client: Client,
        base_url: impl AsRef<str>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: normalize_base_url(base_url.as_ref()),
            model: model.into(),
            dimension: None,
        }
    }

    /// Declare the vector length; responses of another length are rejected.
    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = Some(dimension);
        self
    }
}

#[async_trait]
impl EmbeddingModel for OllamaEmbedding {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/api/embed", self.base_url);
        let body = json!({ "model": self.model, "input": texts });
        let resp = post_json(&self.client, &url, &body).await?;
        let parsed: EmbedResponse = resp.json().await?;
        if let Some(dim) = self.dimension {
            if let Some(bad) = parsed.embeddings.iter().find(|v| v.len() != dim) {
                return Err(PipelineError::Other(format!(
                    "{} returned a {}-dimensional vector, expected {}",
                    self.model,
                    bad.len(),
                    dim
                )));
            }
        }
        Ok(parsed.embeddings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_construction_normalizes_url() {
        let model = OllamaEmbedding::with_client(
            Client::new(),
            "http://localhost:11434/api/embed",
            "nomic-embed-text",
        )
        .with_dimension(768);
        assert_eq!(model.base_url, "http://localhost:11434");
        assert_eq!(model.model_id(), "nomic-embed-text");
        assert_eq!(model.dimension(), Some(768));
    }

    #[tokio::test]
    async fn test_empty_batch_skips_request() {
        // Unroutable address: a request would fail.
        let model = OllamaEmbedding::with_client(Client::new(), "http://127.0.0.1:9", "m");
        assert!(model.embed_batch(&[]).await.unwrap().is_empty());
    }

    #[test]
    fn test_parse_response() {
        let parsed: EmbedResponse =
            serde_json::from_str(r#"{"model":"m","embeddings":[[0.1,0.2],[0.3,0.4]]}"#).unwrap();
        assert_eq!(parsed.embeddings.len(), 2);
    }
}
