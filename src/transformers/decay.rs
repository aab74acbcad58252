//! Exponential prominence decay with pruning.

use crate::error::Result;
use crate::message::Message;
use crate::snapshot::ConversationSnapshot;
use crate::transformer::{Transformer, TransformerResult};
use crate::turn_state::TurnState;
use crate::PipelineError;
use std::collections::HashSet;

/// Decays prominence by message age and drops what falls below a threshold.
///
/// Each non-system message is scaled by `0.5^(age / half_life_turns)`, where
/// age is `state.turn_index - message.turn_index`. System messages are never
/// decayed or removed, and the `min_recent_messages` newest non-system
/// messages always survive.
///
/// # Example
///
/// ```
/// use textile::transformers::DecayTransformer;
///
/// let decay = DecayTransformer::new(5, 0.1, 4).unwrap();
/// assert_eq!(decay.half_life_turns(), 5);
/// assert!(DecayTransformer::new(0, 0.1, 4).is_err());
/// ```
#[derive(Debug, Clone)]
pub struct DecayTransformer {
    half_life_turns: u32,
    threshold: f64,
    min_recent_messages: usize,
}

impl DecayTransformer {
    pub fn new(half_life_turns: u32, threshold: f64, min_recent_messages: usize) -> Result<Self> {
        if half_life_turns == 0 {
            return Err(PipelineError::InvalidConfig(
                "half_life_turns must be > 0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&threshold) {
            return Err(PipelineError::InvalidConfig(format!(
                "threshold must be between 0.0 and 1.0, got {}",
                threshold
            )));
        }
        if min_recent_messages < 1 {
            return Err(PipelineError::InvalidConfig(
                "min_recent_messages must be >= 1".into(),
            ));
        }
        Ok(Self {
            half_life_turns,
            threshold,
            min_recent_messages,
        })
    }

    /// Decay prominence without pruning anything.
    pub fn decay_only(half_life_turns: u32) -> Result<Self> {
        Self::new(half_life_turns, 0.0, 1)
    }

    pub fn half_life_turns(&self) -> u32 {
        self.half_life_turns
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn min_recent_messages(&self) -> usize {
        self.min_recent_messages
    }

    fn decay_factor(&self, age: u64) -> f64 {
        0.5f64.powf(age as f64 / f64::from(self.half_life_turns))
    }

    /// Ids of the newest non-system messages (by turn, then position).
    fn recent_ids(&self, snapshot: &ConversationSnapshot) -> HashSet<String> {
        let mut non_system: Vec<(usize, &Message)> = snapshot
            .messages()
            .iter()
            .enumerate()
            .filter(|(_, m)| !m.is_system())
            .collect();
        non_system.sort_by(|(pa, a), (pb, b)| {
            b.turn_index().cmp(&a.turn_index()).then(pb.cmp(pa))
        });
        non_system
            .into_iter()
            .take(self.min_recent_messages)
            .map(|(_, m)| m.id().to_string())
            .collect()
    }
}

impl Transformer for DecayTransformer {
    fn name(&self) -> &str {
        "decay"
    }

    fn should_apply(&self, snapshot: &ConversationSnapshot, _state: &TurnState) -> bool {
        snapshot.len() > 1
    }

    fn transform(
        &self,
        mut snapshot: ConversationSnapshot,
        state: &TurnState,
    ) -> Result<TransformerResult> {
        let current = state.turn_index;
        for msg in snapshot.iter_mut().filter(|m| !m.is_system()) {
            let age = current.saturating_sub(msg.turn_index());
            let before = msg.metadata.prominence();
            msg.metadata.scale_prominence(self.decay_factor(age))?;
            tracing::debug!(
                id = msg.id(),
                age,
                before,
                after = msg.metadata.prominence(),
                "decayed prominence"
            );
        }

        let recent = self.recent_ids(&snapshot);
        let before = snapshot.len();
        let threshold = self.threshold;
        snapshot.retain(|m| {
            let keep = m.is_system()
                || m.metadata.prominence() >= threshold
                || recent.contains(m.id());
            if !keep {
                tracing::debug!(id = m.id(), prominence = m.metadata.prominence(), "pruned");
            }
            keep
        });
        let pruned = before - snapshot.len();

        Ok(TransformerResult::unchanged_state(snapshot, state).with_metric("pruned", pruned))
    }
}
