//! Prominence threshold filter.

use crate::error::Result;
use crate::snapshot::ConversationSnapshot;
use crate::transformer::{Transformer, TransformerResult};
use crate::turn_state::TurnState;
use crate::PipelineError;
use std::collections::HashSet;

/// Removes non-system messages whose prominence is below `threshold`.
///
/// At least `keep_min` non-system messages survive (highest prominence
/// first, most recent on ties). `keep_min(0)` lets the filter remove every
/// non-system message and leaves recovery to the pipeline.
#[derive(Debug, Clone)]
pub struct ThresholdFilter {
    threshold: f64,
    keep_min: usize,
}

impl ThresholdFilter {
    pub fn new(threshold: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(PipelineError::InvalidConfig(format!(
                "threshold must be between 0.0 and 1.0, got {}",
                threshold
            )));
        }
        Ok(Self {
            threshold,
            keep_min: 1,
        })
    }

    pub fn keep_min(mut self, keep_min: usize) -> Self {
        self.keep_min = keep_min;
        self
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }
}

impl Transformer for ThresholdFilter {
    fn name(&self) -> &str {
        "threshold"
    }

    fn should_apply(&self, snapshot: &ConversationSnapshot, _state: &TurnState) -> bool {
        snapshot
            .messages()
            .iter()
            .any(|m| !m.is_system() && m.metadata.prominence() < self.threshold)
    }

    fn transform(
        &self,
        mut snapshot: ConversationSnapshot,
        state: &TurnState,
    ) -> Result<TransformerResult> {
        let mut ranked: Vec<(usize, f64, u64, String)> = snapshot
            .messages()
            .iter()
            .enumerate()
            .filter(|(_, m)| !m.is_system())
            .map(|(pos, m)| (pos, m.metadata.prominence(), m.turn_index(), m.id().to_string()))
            .collect();
        ranked.sort_by(|a, b| {
            b.1.total_cmp(&a.1)
                .then(b.2.cmp(&a.2))
                .then(b.0.cmp(&a.0))
        });
        let protected: HashSet<String> = ranked
            .into_iter()
            .take(self.keep_min)
            .map(|(_, _, _, id)| id)
            .collect();

        let before = snapshot.len();
        let threshold = self.threshold;
        snapshot.retain(|m| {
            m.is_system() || m.metadata.prominence() >= threshold || protected.contains(m.id())
        });
        let removed = before - snapshot.len();
        tracing::debug!(threshold, removed, "threshold filter applied");

        Ok(TransformerResult::unchanged_state(snapshot, state).with_metric("removed", removed))
    }
}
