//! Reference transformers.
//!
//! | Transformer | Needs | Effect |
//! |---|---|---|
//! | [`DecayTransformer`] | turn indices | ages prominence, prunes stale messages |
//! | [`ThresholdFilter`] | prominence | drops low-prominence messages |
//! | [`EmbedMessages`] | an [`EmbeddingModel`] | fills missing embeddings |
//! | [`SemanticPruneTransformer`] | embeddings | drops messages unrelated to the query |
//! | [`SemanticDecayTransformer`] | turn indices, embeddings | prunes old off-topic messages |
//! | [`ToolSelectionTransformer`] | an embedding model | trims the tool list |
//!
//! None of them removes system messages.
//!
//! [`EmbeddingModel`]: crate::embeddings::EmbeddingModel

mod decay;
mod embed;
mod semantic_decay;
mod semantic_prune;
mod threshold;
mod tool_selection;

pub use decay::DecayTransformer;
pub use embed::EmbedMessages;
pub use semantic_decay::{
    MessageType, SemanticDecayConfig, SemanticDecayMetadata, SemanticDecayTransformer,
};
pub use semantic_prune::SemanticPruneTransformer;
pub use threshold::ThresholdFilter;
pub use tool_selection::ToolSelectionTransformer;
