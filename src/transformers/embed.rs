//! Fill in missing embeddings.

use crate::embeddings::CachedEmbedder;
use crate::error::Result;
use crate::rt;
use crate::snapshot::ConversationSnapshot;
use crate::transformer::{BoxFut, Transformer, TransformerResult};
use crate::turn_state::TurnState;
use crate::PipelineError;

/// Embeds messages that have no vector yet, plus the query.
///
/// Runs through a [`CachedEmbedder`], so content already seen by this model
/// costs a cache lookup. Place it before transformers that need embeddings,
/// such as [`SemanticPruneTransformer`](super::SemanticPruneTransformer).
///
/// The step does I/O and is meant for `run_async`. The synchronous path
/// drives a private runtime and fails (recoverably) when called from inside
/// an async runtime.
#[derive(Debug, Clone)]
pub struct EmbedMessages {
    embedder: CachedEmbedder,
    embed_query: bool,
}

impl EmbedMessages {
    pub fn new(embedder: CachedEmbedder) -> Self {
        Self {
            embedder,
            embed_query: true,
        }
    }

    /// Leave `TurnState::query_embedding` untouched.
    pub fn without_query(mut self) -> Self {
        self.embed_query = false;
        self
    }

    fn needs_query(&self, state: &TurnState) -> bool {
        self.embed_query && state.query_embedding.is_none() && !state.user_message.is_empty()
    }

    async fn embed(
        &self,
        mut snapshot: ConversationSnapshot,
        state: &TurnState,
    ) -> Result<TransformerResult> {
        let fail = |e: PipelineError| PipelineError::transform(self.name(), e.to_string());

        let pending: Vec<usize> = snapshot
            .messages()
            .iter()
            .enumerate()
            .filter(|(_, m)| m.embedding.is_none())
            .map(|(i, _)| i)
            .collect();
        let mut texts: Vec<String> = pending
            .iter()
            .map(|&i| snapshot.messages()[i].content().to_string())
            .collect();
        let with_query = self.needs_query(state);
        if with_query {
            texts.push(state.user_message.clone());
        }

        let mut vectors = self.embedder.embed_all(&texts).await.map_err(fail)?;
        let mut new_state = state.clone();
        if with_query {
            new_state.query_embedding = vectors.pop();
        }
        let embedded = pending.len();
        for (msg, vector) in snapshot
            .iter_mut()
            .filter(|m| m.embedding.is_none())
            .zip(vectors)
        {
            *msg.embedding = Some(vector);
        }
        tracing::debug!(embedded, query = with_query, "filled embeddings");

        Ok(TransformerResult::new(snapshot, new_state).with_metric("embedded", embedded))
    }
}

impl Transformer for EmbedMessages {
    fn name(&self) -> &str {
        "embed_messages"
    }

    fn should_apply(&self, snapshot: &ConversationSnapshot, state: &TurnState) -> bool {
        self.needs_query(state) || snapshot.messages().iter().any(|m| m.embedding.is_none())
    }

    fn transform(
        &self,
        snapshot: ConversationSnapshot,
        state: &TurnState,
    ) -> Result<TransformerResult> {
        rt::block_on(self.name(), self.embed(snapshot, state))?
    }

    fn transform_async<'a>(
        &'a self,
        snapshot: ConversationSnapshot,
        state: &'a TurnState,
    ) -> BoxFut<'a, Result<TransformerResult>> {
        Box::pin(self.embed(snapshot, state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{Cache, CacheKey, InMemoryCache};
    use crate::embeddings::{EmbeddingModel, HashEmbedding};
    use crate::message::Message;
    use crate::pipeline::Pipeline;
    use std::sync::Arc;

    fn snapshot() -> ConversationSnapshot {
        ConversationSnapshot::from_messages(vec![
            Message::system("You are terse").with_id("sys"),
            Message::user("rust borrow checker").with_id("u0"),
            Message::assistant("done").with_id("a0").with_embedding(vec![9.0; 16]),
        ])
        .unwrap()
    }

    #[tokio::test]
    async fn test_fills_missing_embeddings_and_query() {
        let model = Arc::new(HashEmbedding::new(16));
        let cache = Arc::new(InMemoryCache::new(64));
        let step = EmbedMessages::new(CachedEmbedder::new(model.clone(), cache));
        let state = TurnState::new("what about lifetimes", 1);

        let out = step.transform_async(snapshot(), &state).await.unwrap();
        assert_eq!(
            out.snapshot.get("u0").unwrap().embedding,
            Some(model.vector("rust borrow checker"))
        );
        assert_eq!(out.snapshot.get("a0").unwrap().embedding, Some(vec![9.0; 16]));
        assert_eq!(out.state.query_embedding, Some(model.vector("what about lifetimes")));
        assert!(state.query_embedding.is_none());
        assert_eq!(out.metrics()["embedded"], 2);
        assert_eq!(model.batch_calls(), 1);
    }

    #[test]
    fn test_sync_path_outside_runtime() {
        let model = Arc::new(HashEmbedding::new(16));
        let step = EmbedMessages::new(CachedEmbedder::new(model, Arc::new(InMemoryCache::new(64))))
            .without_query();
        let out = step.transform(snapshot(), &TurnState::new("q", 0)).unwrap();
        assert!(out.snapshot.messages().iter().all(|m| m.embedding.is_some()));
        assert!(out.state.query_embedding.is_none());
    }

    #[tokio::test]
    async fn test_sync_path_inside_runtime_is_recoverable() {
        let step = EmbedMessages::new(CachedEmbedder::new(
            Arc::new(HashEmbedding::new(4)),
            Arc::new(InMemoryCache::new(8)),
        ));
        let pipeline = Pipeline::builder().transformer(step).build().unwrap();
        // The sync run absorbs the failure and returns the input unchanged.
        let out = pipeline.run(snapshot(), TurnState::new("q", 0)).unwrap();
        assert!(out.snapshot.get("u0").unwrap().embedding.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_runs_share_cache() {
        let model = Arc::new(HashEmbedding::new(32));
        let cache = Arc::new(InMemoryCache::new(64));
        let embedder = CachedEmbedder::new(model.clone(), cache.clone());
        let pipeline = Arc::new(
            Pipeline::builder()
                .transformer(EmbedMessages::new(embedder))
                .build()
                .unwrap(),
        );

        let runs: Vec<_> = (0..8)
            .map(|_| {
                let pipeline = Arc::clone(&pipeline);
                tokio::spawn(async move {
                    pipeline.run_async(snapshot(), TurnState::new("same question", 0)).await
                })
            })
            .collect();
        for run in runs {
            run.await.unwrap().unwrap();
        }

        let key = CacheKey::embedding(model.model_id(), "rust borrow checker");
        let cached = cache.get(&key).unwrap();
        assert_eq!(cached.as_embedding().unwrap(), model.vector("rust borrow checker").as_slice());
        // sys + u0 + query, each stored once
        assert_eq!(cache.len(), 3);
    }
}
