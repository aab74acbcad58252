//! Combined semantic and temporal relevance decay.

use crate::error::Result;
use crate::message::{MessageMetadata, MessageMut, Role};
use crate::similarity::cosine_similarity;
use crate::snapshot::ConversationSnapshot;
use crate::transformer::{Transformer, TransformerResult};
use crate::turn_state::TurnState;
use crate::PipelineError;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;

/// Metadata namespace holding a [`SemanticDecayMetadata`].
pub const NAMESPACE: &str = "semantic_decay";

const DEFAULT_SALIENCE: f64 = 0.5;

/// Coarse message kind; each kind scales relevance by its own modifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    System,
    Instruction,
    Factual,
    Conversational,
    Historical,
}

impl MessageType {
    pub fn modifier(self) -> f64 {
        match self {
            MessageType::System => 1.0,
            MessageType::Instruction => 0.9,
            MessageType::Factual => 0.8,
            MessageType::Conversational => 0.6,
            MessageType::Historical => 0.4,
        }
    }

    /// Classify from the role and the `is_instruction`, `is_factual` and
    /// `is_historical` raw flags, in that order.
    pub fn infer(role: Role, metadata: &MessageMetadata) -> Self {
        let flag = |key: &str| metadata.raw(key).and_then(|v| v.as_bool()) == Some(true);
        if role.is_system() {
            MessageType::System
        } else if role == Role::User && flag("is_instruction") {
            MessageType::Instruction
        } else if flag("is_factual") {
            MessageType::Factual
        } else if flag("is_historical") {
            MessageType::Historical
        } else {
            MessageType::Conversational
        }
    }
}

/// Per-message state kept under the [`NAMESPACE`] metadata namespace.
///
/// Created on first sight of a message; set it beforehand to pin a
/// message's type or raise its salience.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticDecayMetadata {
    /// Importance boost in `[0.0, 1.0]`.
    pub salience: f64,
    pub last_access_turn: u64,
    pub message_type: MessageType,
}

impl SemanticDecayMetadata {
    pub fn new(salience: f64, last_access_turn: u64, message_type: MessageType) -> Self {
        Self {
            salience,
            last_access_turn,
            message_type,
        }
    }
}

/// Tunables for [`SemanticDecayTransformer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SemanticDecayConfig {
    /// Turns for the temporal component to halve.
    pub half_life_turns: u32,
    /// Minimum relevance to keep a message.
    pub threshold: f64,
    /// Minimum query similarity to keep a message when embeddings exist.
    pub semantic_threshold: f64,
    /// Exponent applied to similarity; higher is stricter.
    pub semantic_decay_power: f64,
    pub semantic_weight: f64,
    pub temporal_weight: f64,
    /// Scale of the salience boost.
    pub salience_decay: f64,
    /// Largest boost for recently accessed messages.
    pub recency_multiplier: f64,
    /// Turns after which the recency boost is gone.
    pub recency_threshold: u32,
}

impl Default for SemanticDecayConfig {
    fn default() -> Self {
        Self {
            half_life_turns: 4,
            threshold: 0.1,
            semantic_threshold: 0.3,
            semantic_decay_power: 1.5,
            semantic_weight: 0.6,
            temporal_weight: 0.4,
            salience_decay: 0.2,
            recency_multiplier: 0.3,
            recency_threshold: 10,
        }
    }
}

fn unit_range(name: &str, value: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(PipelineError::InvalidConfig(format!(
            "{} must be between 0.0 and 1.0, got {}",
            name, value
        )));
    }
    Ok(())
}

impl SemanticDecayConfig {
    fn validate(&self) -> Result<()> {
        unit_range("threshold", self.threshold)?;
        unit_range("semantic_threshold", self.semantic_threshold)?;
        unit_range("semantic_weight", self.semantic_weight)?;
        unit_range("temporal_weight", self.temporal_weight)?;
        let sum = self.semantic_weight + self.temporal_weight;
        if (sum - 1.0).abs() > 0.01 {
            return Err(PipelineError::InvalidConfig(format!(
                "semantic_weight and temporal_weight must sum to 1.0, got {} + {} = {}",
                self.semantic_weight, self.temporal_weight, sum
            )));
        }
        if !(self.semantic_decay_power >= 1.0 && self.semantic_decay_power.is_finite()) {
            return Err(PipelineError::InvalidConfig(format!(
                "semantic_decay_power must be >= 1.0, got {}",
                self.semantic_decay_power
            )));
        }
        if self.half_life_turns == 0 {
            return Err(PipelineError::InvalidConfig("half_life_turns must be > 0".into()));
        }
        for (name, value) in [
            ("salience_decay", self.salience_decay),
            ("recency_multiplier", self.recency_multiplier),
        ] {
            if !(value >= 0.0 && value.is_finite()) {
                return Err(PipelineError::InvalidConfig(format!(
                    "{} must be >= 0.0, got {}",
                    name, value
                )));
            }
        }
        if self.recency_threshold == 0 {
            return Err(PipelineError::InvalidConfig("recency_threshold must be > 0".into()));
        }
        Ok(())
    }
}

/// The factors behind one relevance score, stored as `decay_components`.
#[derive(Debug, Clone, Copy, Serialize)]
struct Components {
    #[serde(rename = "R0")]
    initial: f64,
    m_type: f64,
    #[serde(rename = "D_semantic")]
    semantic: f64,
    #[serde(rename = "D_temporal")]
    temporal: f64,
    combined_decay: f64,
    #[serde(rename = "D_salience")]
    salience_boost: f64,
    #[serde(rename = "w_recency")]
    recency_boost: f64,
    similarity: f64,
    age_turns: u64,
    salience: f64,
}

impl Components {
    fn relevance(&self) -> f64 {
        self.initial * self.m_type * self.combined_decay * self.salience_boost * self.recency_boost
    }
}

/// Prunes messages that are both old and off-topic.
///
/// Relevance is `R0 * m_type * combined * salience_boost * recency_boost`
/// with `combined = w_sem * sim^power + w_temp * 0.5^(age / half_life)`,
/// where `R0` is the current prominence. The result becomes the new
/// prominence (clamped to 1.0). A non-system message survives when its
/// relevance reaches `threshold` and, if the conversation carries any
/// embeddings, its query similarity reaches `semantic_threshold`. An old
/// message that is still on topic stays. System messages always stay, and
/// when every non-system message would go, the most relevant one is kept.
///
/// Messages without an embedding (or a turn without a query embedding)
/// score as fully similar.
///
/// # Example
///
/// ```
/// use textile::transformers::{SemanticDecayConfig, SemanticDecayTransformer};
///
/// let config = SemanticDecayConfig {
///     semantic_weight: 0.7,
///     temporal_weight: 0.3,
///     ..SemanticDecayConfig::default()
/// };
/// assert!(SemanticDecayTransformer::new(config).is_ok());
///
/// let lopsided = SemanticDecayConfig {
///     semantic_weight: 0.9,
///     ..SemanticDecayConfig::default()
/// };
/// assert!(SemanticDecayTransformer::new(lopsided).is_err());
/// ```
#[derive(Debug, Clone, Default)]
pub struct SemanticDecayTransformer {
    config: SemanticDecayConfig,
}

impl SemanticDecayTransformer {
    pub fn new(config: SemanticDecayConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &SemanticDecayConfig {
        &self.config
    }

    fn note_for(&self, msg: &MessageMut<'_>) -> Result<SemanticDecayMetadata> {
        let stored = msg
            .metadata
            .namespace::<SemanticDecayMetadata>(NAMESPACE)
            .map_err(|e| PipelineError::transform(self.name(), e.to_string()))?;
        match stored {
            Some(note) if !(0.0..=1.0).contains(&note.salience) => Err(PipelineError::transform(
                self.name(),
                format!("salience must be 0.0-1.0, got {} on {}", note.salience, msg.id()),
            )),
            Some(note) => Ok(note),
            None => Ok(SemanticDecayMetadata::new(
                DEFAULT_SALIENCE,
                msg.turn_index(),
                MessageType::infer(msg.role(), msg.metadata),
            )),
        }
    }

    fn components(
        &self,
        msg: &MessageMut<'_>,
        note: &SemanticDecayMetadata,
        current: u64,
        query: Option<&[f32]>,
    ) -> Components {
        let cfg = &self.config;
        let age_turns = current.saturating_sub(msg.turn_index());
        let temporal = 0.5f64.powf(age_turns as f64 / f64::from(cfg.half_life_turns));

        let (semantic, similarity) = match (msg.embedding.as_deref(), query) {
            (Some(embedding), Some(query)) => match cosine_similarity(query, embedding) {
                Ok(sim) => {
                    let sim = f64::from(sim);
                    (sim.powf(cfg.semantic_decay_power), sim)
                }
                Err(err) => {
                    tracing::warn!(
                        id = msg.id(),
                        error = %err,
                        "similarity failed; treating as on-topic"
                    );
                    (1.0, 1.0)
                }
            },
            _ => (1.0, 1.0),
        };

        let since_access = current.saturating_sub(note.last_access_turn);
        let recency_boost = if since_access <= u64::from(cfg.recency_threshold) {
            let factor = 1.0 - since_access as f64 / f64::from(cfg.recency_threshold);
            1.0 + cfg.recency_multiplier * factor
        } else {
            1.0
        };

        Components {
            initial: msg.metadata.prominence(),
            m_type: note.message_type.modifier(),
            semantic,
            temporal,
            combined_decay: cfg.semantic_weight * semantic + cfg.temporal_weight * temporal,
            salience_boost: 1.0 + note.salience * cfg.salience_decay,
            recency_boost,
            similarity,
            age_turns,
            salience: note.salience,
        }
    }
}

struct Scored {
    id: String,
    system: bool,
    relevance: f64,
    similarity: f64,
}

impl Transformer for SemanticDecayTransformer {
    fn name(&self) -> &str {
        "semantic_decay"
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
        let query = state.query_embedding.as_deref();
        let has_embeddings = snapshot.messages().iter().any(|m| m.embedding.is_some());

        let mut scored = Vec::with_capacity(snapshot.len());
        for msg in snapshot.iter_mut() {
            let note = self.note_for(&msg)?;
            let parts = self.components(&msg, &note, current, query);
            let relevance = parts.relevance();
            tracing::debug!(
                id = msg.id(),
                relevance,
                similarity = parts.similarity,
                age = parts.age_turns,
                kind = ?note.message_type,
                "scored message"
            );

            msg.metadata.set_prominence(relevance)?;
            msg.metadata.set_namespace(
                NAMESPACE,
                &SemanticDecayMetadata {
                    last_access_turn: current,
                    ..note
                },
            )?;
            msg.metadata.set_raw("relevance", json!(relevance));
            msg.metadata.set_namespace("decay_components", &parts)?;
            scored.push(Scored {
                id: msg.id().to_string(),
                system: msg.is_system(),
                relevance,
                similarity: parts.similarity,
            });
        }

        let cfg = &self.config;
        let mut keep: HashSet<&str> = scored
            .iter()
            .filter(|s| {
                s.system
                    || (s.relevance >= cfg.threshold
                        && (!has_embeddings || s.similarity >= cfg.semantic_threshold))
            })
            .map(|s| s.id.as_str())
            .collect();
        let any_kept = scored.iter().any(|s| !s.system && keep.contains(s.id.as_str()));
        if !any_kept {
            let best = scored.iter().filter(|s| !s.system).fold(None, |best: Option<&Scored>, s| {
                match best {
                    Some(b) if b.relevance >= s.relevance => Some(b),
                    _ => Some(s),
                }
            });
            if let Some(best) = best {
                tracing::debug!(
                    id = %best.id,
                    relevance = best.relevance,
                    "keeping most relevant message"
                );
                keep.insert(best.id.as_str());
            }
        }

        let before = snapshot.len();
        snapshot.retain(|m| keep.contains(m.id()));
        let pruned = before - snapshot.len();

        let mut next = state.clone();
        if pruned > 0 {
            next = next.with_extension("semantic_decay_pruned", json!(pruned));
        }
        Ok(TransformerResult::new(snapshot, next).with_metric("pruned", pruned))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    fn relevance(out: &TransformerResult, id: &str) -> f64 {
        out.snapshot.get(id).unwrap().metadata.raw("relevance").unwrap().as_f64().unwrap()
    }

    fn note(out: &TransformerResult, id: &str) -> SemanticDecayMetadata {
        out.snapshot
            .get(id)
            .unwrap()
            .metadata
            .namespace(NAMESPACE)
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_validation() {
        let bad = |f: fn(&mut SemanticDecayConfig)| {
            let mut config = SemanticDecayConfig::default();
            f(&mut config);
            matches!(SemanticDecayTransformer::new(config), Err(PipelineError::InvalidConfig(_)))
        };
        assert!(SemanticDecayTransformer::new(SemanticDecayConfig::default()).is_ok());
        assert!(bad(|c| c.threshold = 1.5));
        assert!(bad(|c| c.semantic_threshold = -0.1));
        assert!(bad(|c| c.semantic_weight = 0.9));
        assert!(bad(|c| {
            c.semantic_weight = 1.2;
            c.temporal_weight = -0.2;
        }));
        assert!(bad(|c| c.semantic_decay_power = 0.5));
        assert!(bad(|c| c.half_life_turns = 0));
        assert!(bad(|c| c.recency_threshold = 0));
        assert!(bad(|c| c.salience_decay = -1.0));
        // within tolerance of 1.0
        assert!(!bad(|c| c.temporal_weight = 0.405));
    }

    #[test]
    fn test_relevance_without_embeddings() {
        let snapshot = ConversationSnapshot::from_messages(vec![
            Message::system("rules").with_id("sys"),
            Message::user("hello").with_id("u0").at_turn(0),
        ])
        .unwrap();
        let out = SemanticDecayTransformer::default()
            .transform(snapshot, &TurnState::new("next", 4))
            .unwrap();

        // temporal 0.5, combined 0.6 + 0.4 * 0.5, salience 1.1, recency 1 + 0.3 * 0.6
        let expected = 0.6 * 0.8 * 1.1 * 1.18;
        assert!(close(relevance(&out, "u0"), expected));
        assert!(close(out.snapshot.get("u0").unwrap().metadata.prominence(), expected));
        // system relevance exceeds 1.0 and is clamped
        assert_eq!(out.snapshot.get("sys").unwrap().metadata.prominence(), 1.0);

        let stored = note(&out, "u0");
        assert_eq!(stored.message_type, MessageType::Conversational);
        assert_eq!(stored.last_access_turn, 4);
        assert_eq!(note(&out, "sys").message_type, MessageType::System);
        assert!(out.snapshot.get("u0").unwrap().metadata.has_namespace("decay_components"));
    }

    #[test]
    fn test_message_type_inference() {
        let mut instruction = Message::user("always answer in French").with_id("i");
        instruction.metadata.set_raw("is_instruction", json!(true));
        let mut fact = Message::assistant("Paris is the capital").with_id("f");
        fact.metadata.set_raw("is_factual", json!(true));
        let mut old = Message::assistant("earlier summary").with_id("h");
        old.metadata.set_raw("is_historical", json!(true));
        let mut not_user = Message::assistant("flagged, but not a user").with_id("a");
        not_user.metadata.set_raw("is_instruction", json!(true));

        let snapshot =
            ConversationSnapshot::from_messages(vec![instruction, fact, old, not_user]).unwrap();
        let out = SemanticDecayTransformer::default()
            .transform(snapshot, &TurnState::new("q", 0))
            .unwrap();
        assert_eq!(note(&out, "i").message_type, MessageType::Instruction);
        assert_eq!(note(&out, "f").message_type, MessageType::Factual);
        assert_eq!(note(&out, "h").message_type, MessageType::Historical);
        assert_eq!(note(&out, "a").message_type, MessageType::Conversational);
    }

    #[test]
    fn test_stored_metadata_is_honoured() {
        let mut msg = Message::user("pinned fact").with_id("u0");
        msg.metadata
            .set_namespace(NAMESPACE, &SemanticDecayMetadata::new(1.0, 0, MessageType::Factual))
            .unwrap();
        let snapshot = ConversationSnapshot::from_messages(vec![msg]).unwrap();
        let out = SemanticDecayTransformer::default()
            .transform(snapshot, &TurnState::new("q", 4))
            .unwrap();
        // factual 0.8, salience boost 1.2
        assert!(close(relevance(&out, "u0"), 0.8 * 0.8 * 1.2 * 1.18));
    }

    #[test]
    fn test_old_on_topic_kept_old_off_topic_pruned() {
        let snapshot = ConversationSnapshot::from_messages(vec![
            Message::system("rules").with_id("sys"),
            Message::user("on topic").with_id("on").at_turn(0).with_embedding(vec![1.0, 0.0]),
            Message::user("off topic").with_id("off").at_turn(0).with_embedding(vec![0.0, 1.0]),
            Message::user("latest").with_id("now").at_turn(8).with_embedding(vec![0.6, 0.8]),
        ])
        .unwrap();
        let state = TurnState::new("latest", 8).with_query_embedding(vec![1.0, 0.0]);
        let out = SemanticDecayTransformer::default().transform(snapshot, &state).unwrap();

        assert_eq!(out.snapshot.ids(), vec!["sys", "on", "now"]);
        assert_eq!(out.metrics()["pruned"], 1);
        assert_eq!(out.state.extensions["semantic_decay_pruned"], json!(1));
        // on topic: (0.6 + 0.4 * 0.25) * 0.6 * 1.1 * 1.06
        assert!(close(relevance(&out, "on"), 0.7 * 0.6 * 1.1 * 1.06));
    }

    #[test]
    fn test_similarity_gate_applies_only_with_embeddings() {
        let config = SemanticDecayConfig {
            semantic_threshold: 0.9,
            ..SemanticDecayConfig::default()
        };
        let decay = SemanticDecayTransformer::new(config).unwrap();
        let snapshot = ConversationSnapshot::from_messages(vec![
            Message::user("a").with_id("a").at_turn(5),
            Message::user("b").with_id("b").at_turn(5),
        ])
        .unwrap();
        let out = decay.transform(snapshot, &TurnState::new("b", 5)).unwrap();
        assert_eq!(out.snapshot.len(), 2);
        assert!(!out.state.extensions.contains_key("semantic_decay_pruned"));
    }

    #[test]
    fn test_keeps_most_relevant_when_all_fall_below() {
        let config = SemanticDecayConfig {
            threshold: 1.0,
            ..SemanticDecayConfig::default()
        };
        let decay = SemanticDecayTransformer::new(config).unwrap();
        let snapshot = ConversationSnapshot::from_messages(vec![
            Message::system("rules").with_id("sys"),
            Message::user("older").with_id("u0").at_turn(0),
            Message::user("newer").with_id("u2").at_turn(2),
        ])
        .unwrap();
        let out = decay.transform(snapshot, &TurnState::new("newer", 2)).unwrap();
        assert_eq!(out.snapshot.ids(), vec!["sys", "u2"]);
    }

    #[test]
    fn test_malformed_namespace_is_runtime_error() {
        let mut msg = Message::user("x").with_id("x");
        msg.metadata.set_raw(NAMESPACE, json!("garbage"));
        let snapshot = ConversationSnapshot::from_messages(vec![msg]).unwrap();
        let err = SemanticDecayTransformer::default()
            .transform(snapshot, &TurnState::default())
            .unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_should_apply_needs_two_messages() {
        let decay = SemanticDecayTransformer::default();
        let one = ConversationSnapshot::from_messages(vec![Message::user("hi")]).unwrap();
        assert!(!decay.should_apply(&one, &TurnState::default()));
    }
}
