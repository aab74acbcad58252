//! Query-relevance pruning.

use crate::error::Result;
use crate::similarity::cosine_similarity;
use crate::snapshot::ConversationSnapshot;
use crate::transformer::{Transformer, TransformerResult};
use crate::turn_state::TurnState;
use crate::PipelineError;
use std::collections::HashSet;

/// Removes non-system messages whose embedding is dissimilar to the query.
///
/// Messages without an embedding are left alone, as are messages whose
/// similarity cannot be computed (for example a dimension mismatch). If every
/// non-system message would go, the most recent one is kept.
#[derive(Debug, Clone)]
pub struct SemanticPruneTransformer {
    threshold: f32,
}

impl SemanticPruneTransformer {
    pub fn new(threshold: f32) -> Result<Self> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(PipelineError::InvalidConfig(format!(
                "similarity threshold must be in [0, 1], got {}",
                threshold
            )));
        }
        Ok(Self { threshold })
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }
}

impl Transformer for SemanticPruneTransformer {
    fn name(&self) -> &str {
        "semantic_prune"
    }

    fn should_apply(&self, snapshot: &ConversationSnapshot, _state: &TurnState) -> bool {
        snapshot.messages().iter().any(|m| m.embedding.is_some())
    }

    fn transform(
        &self,
        mut snapshot: ConversationSnapshot,
        state: &TurnState,
    ) -> Result<TransformerResult> {
        let query = state
            .query_embedding
            .as_deref()
            .ok_or_else(|| {
                PipelineError::transform(self.name(), "turn state has no query embedding")
            })?;

        let mut doomed: HashSet<String> = HashSet::new();
        for msg in snapshot.messages().iter().filter(|m| !m.is_system()) {
            let Some(embedding) = msg.embedding.as_deref() else {
                continue;
            };
            match cosine_similarity(query, embedding) {
                Ok(sim) if sim < self.threshold => {
                    doomed.insert(msg.id().to_string());
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(
                        id = msg.id(),
                        error = %err,
                        "similarity failed; keeping message"
                    );
                }
            }
        }

        let non_system: Vec<(usize, u64, &str)> = snapshot
            .messages()
            .iter()
            .enumerate()
            .filter(|(_, m)| !m.is_system())
            .map(|(pos, m)| (pos, m.turn_index(), m.id()))
            .collect();
        if !non_system.is_empty() && non_system.iter().all(|(_, _, id)| doomed.contains(*id)) {
            let newest = non_system
                .iter()
                .max_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)));
            if let Some((_, turn, id)) = newest {
                tracing::warn!(
                    id = *id,
                    turn,
                    "pruning would empty the conversation; keeping most recent"
                );
                doomed.remove(*id);
            }
        }

        let removed = doomed.len();
        snapshot.retain(|m| !doomed.contains(m.id()));
        Ok(TransformerResult::unchanged_state(snapshot, state).with_metric("removed", removed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    fn snapshot() -> ConversationSnapshot {
        ConversationSnapshot::from_messages(vec![
            Message::system("s").with_id("sys").with_embedding(vec![0.0, 1.0]),
            Message::user("about rust").with_id("rust").at_turn(0).with_embedding(vec![1.0, 0.0]),
            Message::user("about cooking")
                .with_id("cook")
                .at_turn(1)
                .with_embedding(vec![0.0, 1.0]),
            Message::assistant("no vector").with_id("plain").at_turn(1),
        ])
        .unwrap()
    }

    #[test]
    fn test_prunes_dissimilar() {
        let prune = SemanticPruneTransformer::new(0.5).unwrap();
        let state = TurnState::new("rust?", 2).with_query_embedding(vec![1.0, 0.1]);
        let out = prune.transform(snapshot(), &state).unwrap();
        assert_eq!(out.snapshot.ids(), vec!["sys", "rust", "plain"]);
    }

    #[test]
    fn test_keeps_most_recent_when_all_would_go() {
        let snap = ConversationSnapshot::from_messages(vec![
            Message::user("a").with_id("a").at_turn(0).with_embedding(vec![0.0, 1.0]),
            Message::user("b").with_id("b").at_turn(3).with_embedding(vec![0.0, 1.0]),
            Message::user("c").with_id("c").at_turn(1).with_embedding(vec![0.0, 1.0]),
        ])
        .unwrap();
        let prune = SemanticPruneTransformer::new(0.5).unwrap();
        let state = TurnState::new("q", 4).with_query_embedding(vec![1.0, 0.0]);
        let out = prune.transform(snap, &state).unwrap();
        assert_eq!(out.snapshot.ids(), vec!["b"]);
    }

    #[test]
    fn test_dimension_mismatch_keeps_message() {
        let snap = ConversationSnapshot::from_messages(vec![
            Message::user("odd").with_id("odd").with_embedding(vec![1.0, 0.0, 0.0]),
            Message::user("ok").with_id("ok").with_embedding(vec![1.0, 0.0]),
        ])
        .unwrap();
        let prune = SemanticPruneTransformer::new(0.5).unwrap();
        let state = TurnState::new("q", 0).with_query_embedding(vec![1.0, 0.0]);
        let out = prune.transform(snap, &state).unwrap();
        assert_eq!(out.snapshot.len(), 2);
    }

    #[test]
    fn test_missing_query_embedding_is_runtime_error() {
        let prune = SemanticPruneTransformer::new(0.5).unwrap();
        let err = prune.transform(snapshot(), &TurnState::new("q", 0)).unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_should_apply_requires_embeddings() {
        let prune = SemanticPruneTransformer::new(0.5).unwrap();
        let bare = ConversationSnapshot::from_messages(vec![Message::user("x")]).unwrap();
        assert!(!prune.should_apply(&bare, &TurnState::default()));
        assert!(prune.should_apply(&snapshot(), &TurnState::default()));
        assert!(SemanticPruneTransformer::new(1.2).is_err());
    }
}
