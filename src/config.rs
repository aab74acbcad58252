//! Declarative pipeline settings.
//!
//! [`PipelineSettings`] describes a pipeline as data so it can live in a JSON
//! (or, with the `yaml` feature, YAML) file:
//!
//! ```json
//! {
//!   "transformers": [
//!     { "kind": "embed_messages" },
//!     { "kind": "semantic_prune", "threshold": 0.3 },
//!     { "kind": "decay", "half_life_turns": 5, "threshold": 0.1 }
//!   ],
//!   "reinstate": "most_recent",
//!   "step_timeout_ms": 2000,
//!   "cache": { "max_entries": 5000, "ttl_secs": 3600 }
//! }
//! ```
//!
//! [`PipelineSettings::build`] validates every transformer, so a bad value
//! is reported before any run starts.

use crate::cache::{Cache, InMemoryCache, DEFAULT_MAX_ENTRIES};
use crate::embeddings::{CachedEmbedder, EmbeddingModel};
use crate::error::Result;
use crate::pipeline::{Pipeline, ReinstatePolicy};
use crate::transformers::{
    DecayTransformer, EmbedMessages, SemanticDecayConfig, SemanticDecayTransformer,
    SemanticPruneTransformer, ThresholdFilter, ToolSelectionTransformer,
};
use crate::PipelineError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn default_decay_threshold() -> f64 {
    0.1
}

fn default_min_recent() -> usize {
    10
}

fn default_keep_min() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_max_entries() -> usize {
    DEFAULT_MAX_ENTRIES
}

/// One transformer entry, tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum TransformerSpec {
    Decay {
        half_life_turns: u32,
        #[serde(default = "default_decay_threshold")]
        threshold: f64,
        #[serde(default = "default_min_recent")]
        min_recent_messages: usize,
    },
    Threshold {
        threshold: f64,
        #[serde(default = "default_keep_min")]
        keep_min: usize,
    },
    SemanticPrune {
        threshold: f32,
    },
    /// Every field is optional and defaults as in [`SemanticDecayConfig::default`].
    SemanticDecay(SemanticDecayConfig),
    EmbedMessages {
        #[serde(default = "default_true")]
        embed_query: bool,
    },
    ToolSelection {
        max_tools: usize,
        threshold: f32,
    },
}

impl TransformerSpec {
    fn needs_embeddings(&self) -> bool {
        matches!(
            self,
            TransformerSpec::EmbedMessages { .. } | TransformerSpec::ToolSelection { .. }
        )
    }
}

/// Cache sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheSettings {
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    /// Expiry for cached values; `None` keeps them until evicted.
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            ttl_secs: None,
        }
    }
}

/// Serializable description of a [`Pipeline`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineSettings {
    #[serde(default)]
    pub transformers: Vec<TransformerSpec>,
    #[serde(default)]
    pub reinstate: ReinstatePolicy,
    #[serde(default)]
    pub step_timeout_ms: Option<u64>,
    #[serde(default)]
    pub cache: CacheSettings,
}

impl PipelineSettings {
    pub fn from_json_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    #[cfg(feature = "yaml")]
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(s)?)
    }

    /// Read settings from a file, choosing the format by extension.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&text),
            #[cfg(feature = "yaml")]
            Some("yaml" | "yml") => Self::from_yaml_str(&text),
            other => Err(PipelineError::InvalidConfig(format!(
                "unsupported settings format: {}",
                other.unwrap_or("<none>")
            ))),
        }
    }

    /// Cache described by [`CacheSettings`].
    pub fn build_cache(&self) -> Arc<InMemoryCache> {
        let mut cache = InMemoryCache::new(self.cache.max_entries);
        if let Some(secs) = self.cache.ttl_secs {
            cache = cache.with_default_ttl(Duration::from_secs(secs));
        }
        Arc::new(cache)
    }

    /// Build the pipeline.
    ///
    /// Embedding transformers share one cache and use `model`; listing one
    /// without a model is a configuration error.
    pub fn build(&self, model: Option<Arc<dyn EmbeddingModel>>) -> Result<Pipeline> {
        let cache: Arc<dyn Cache> = self.build_cache();
        let embedder = |spec: &TransformerSpec| -> Result<CachedEmbedder> {
            let model = model.clone().ok_or_else(|| {
                PipelineError::InvalidConfig(format!("{:?} needs an embedding model", spec))
            })?;
            Ok(CachedEmbedder::new(model, Arc::clone(&cache)))
        };

        let mut builder = Pipeline::builder()
            .reinstate_policy(self.reinstate)
            .cache(Arc::clone(&cache));
        if let Some(ms) = self.step_timeout_ms {
            builder = builder.step_timeout(Duration::from_millis(ms));
        }

        for spec in &self.transformers {
            builder = match spec {
                TransformerSpec::Decay {
                    half_life_turns,
                    threshold,
                    min_recent_messages,
                } => builder.transformer(DecayTransformer::new(
                    *half_life_turns,
                    *threshold,
                    *min_recent_messages,
                )?),
                TransformerSpec::Threshold { threshold, keep_min } => {
                    builder.transformer(ThresholdFilter::new(*threshold)?.keep_min(*keep_min))
                }
                TransformerSpec::SemanticPrune { threshold } => {
                    builder.transformer(SemanticPruneTransformer::new(*threshold)?)
                }
                TransformerSpec::SemanticDecay(config) => {
                    builder.transformer(SemanticDecayTransformer::new(config.clone())?)
                }
                TransformerSpec::EmbedMessages { embed_query } => {
                    let step = EmbedMessages::new(embedder(spec)?);
                    builder.transformer(if *embed_query { step } else { step.without_query() })
                }
                TransformerSpec::ToolSelection { max_tools, threshold } => {
                    let cached = embedder(spec)?;
                    builder.transformer(ToolSelectionTransformer::new(
                        cached,
                        *max_tools,
                        *threshold,
                    )?)
                }
            };
        }
        tracing::debug!(
            transformers = self.transformers.len(),
            embedding = self.transformers.iter().any(TransformerSpec::needs_embeddings),
            "built pipeline from settings"
        );
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::HashEmbedding;

    const SAMPLE: &str = r#"{
        "transformers": [
            { "kind": "embed_messages" },
            { "kind": "semantic_prune", "threshold": 0.3 },
            { "kind": "decay", "half_life_turns": 5 },
            { "kind": "threshold", "threshold": 0.2, "keep_min": 2 }
        ],
        "reinstate": "most_recent",
        "step_timeout_ms": 1500,
        "cache": { "max_entries": 32, "ttl_secs": 60 }
    }"#;

    #[test]
    fn test_parse_json_with_defaults() {
        let settings = PipelineSettings::from_json_str(SAMPLE).unwrap();
        assert_eq!(settings.reinstate, ReinstatePolicy::MostRecent);
        assert_eq!(settings.cache.max_entries, 32);
        assert_eq!(
            settings.transformers[2],
            TransformerSpec::Decay {
                half_life_turns: 5,
                threshold: 0.1,
                min_recent_messages: 10
            }
        );
        assert_eq!(settings.transformers[0], TransformerSpec::EmbedMessages { embed_query: true });
    }

    #[test]
    fn test_build_wires_everything() {
        let settings = PipelineSettings::from_json_str(SAMPLE).unwrap();
        let pipeline = settings.build(Some(Arc::new(HashEmbedding::new(16)))).unwrap();
        assert_eq!(
            pipeline.transformer_names(),
            vec!["embed_messages", "semantic_prune", "decay", "threshold"]
        );
        assert_eq!(pipeline.reinstate_policy(), ReinstatePolicy::MostRecent);
        assert!(pipeline.cache().is_some());
    }

    #[test]
    fn test_embedding_step_without_model_fails() {
        let settings = PipelineSettings::from_json_str(SAMPLE).unwrap();
        assert!(matches!(settings.build(None), Err(PipelineError::InvalidConfig(_))));
    }

    #[test]
    fn test_invalid_values_fail_at_build() {
        let settings = PipelineSettings::from_json_str(
            r#"{"transformers":[{"kind":"threshold","threshold":-0.5}]}"#,
        )
        .unwrap();
        assert!(matches!(settings.build(None), Err(PipelineError::InvalidConfig(_))));

        let zero = PipelineSettings::from_json_str(r#"{"step_timeout_ms":0}"#).unwrap();
        assert!(zero.build(None).is_err());
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let parse = PipelineSettings::from_json_str;
        assert!(parse(r#"{"transformers":[{"kind":"decay","half_life":3}]}"#).is_err());
        assert!(parse(r#"{"transformers":[{"kind":"shuffle"}]}"#).is_err());
    }

    #[test]
    fn test_semantic_decay_spec() {
        let settings = PipelineSettings::from_json_str(
            r#"{"transformers":[{"kind":"semantic_decay","half_life_turns":6}]}"#,
        )
        .unwrap();
        let expected = SemanticDecayConfig {
            half_life_turns: 6,
            ..SemanticDecayConfig::default()
        };
        assert_eq!(settings.transformers[0], TransformerSpec::SemanticDecay(expected));
        let pipeline = settings.build(None).unwrap();
        assert_eq!(pipeline.transformer_names(), vec!["semantic_decay"]);

        let lopsided = PipelineSettings::from_json_str(
            r#"{"transformers":[{"kind":"semantic_decay","semantic_weight":0.9}]}"#,
        )
        .unwrap();
        assert!(matches!(lopsided.build(None), Err(PipelineError::InvalidConfig(_))));
        assert!(PipelineSettings::from_json_str(
            r#"{"transformers":[{"kind":"semantic_decay","half_life":3}]}"#
        )
        .is_err());
    }

    #[test]
    fn test_empty_settings_build_identity_pipeline() {
        let pipeline = PipelineSettings::default().build(None).unwrap();
        assert!(pipeline.is_empty());
    }

    #[cfg(feature = "yaml")]
    #[test]
    fn test_parse_yaml() {
        let yaml = "transformers:\n  - kind: decay\n    half_life_turns: 3\n    threshold: 0.2\n\
                    reinstate: highest_prominence\n";
        let settings = PipelineSettings::from_yaml_str(yaml).unwrap();
        assert_eq!(settings.transformers.len(), 1);
    }
}
