use std::time::Duration;
use thiserror::Error;

/// Errors produced by the pipeline, its transformers, and the backends.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Low-level HTTP transport failure (connection refused, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// JSON parsing failed at the serde level.
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML settings could not be parsed.
    #[cfg(feature = "yaml")]
    #[error("YAML parsing failed: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O failure (for example while starting a blocking runtime).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration detected at construction time.
    ///
    /// Raised before any run starts; never produced by a running pipeline.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A transformer failed while transforming.
    ///
    /// The orchestrator recovers from this: the step's effect is discarded
    /// and the run continues with the next transformer.
    #[error("Transformer '{transformer}' failed: {message}")]
    TransformFailed { transformer: String, message: String },

    /// An async step exceeded the configured per-step timeout.
    #[error("Transformer '{transformer}' timed out after {timeout:?}")]
    StepTimeout {
        transformer: String,
        timeout: Duration,
    },

    /// The non-empty-conversation invariant could not be restored.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// A message id was inserted twice into the same snapshot.
    #[error("Duplicate message id '{0}'")]
    DuplicateMessage(String),

    /// HTTP error with status code and response body.
    #[error("HTTP {status}: {body}")]
    HttpError {
        /// HTTP status code (e.g. 429, 500, 503).
        status: u16,
        /// Response body text.
        body: String,
    },

    /// Catch-all for other errors.
    #[error("{0}")]
    Other(String),
}

impl PipelineError {
    /// Shorthand for a [`PipelineError::TransformFailed`].
    pub fn transform(transformer: impl Into<String>, message: impl Into<String>) -> Self {
        PipelineError::TransformFailed {
            transformer: transformer.into(),
            message: message.into(),
        }
    }

    /// Whether the orchestrator absorbs this error and keeps running.
    ///
    /// Only runtime transformer failures and step timeouts qualify; anything
    /// else aborts the run.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PipelineError::TransformFailed { .. } | PipelineError::StepTimeout { .. }
        )
    }
}

impl From<anyhow::Error> for PipelineError {
    fn from(err: anyhow::Error) -> Self {
        PipelineError::Other(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Failure reported by a metrics callback. Always logged, never propagated.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("metrics callback failed: {0}")]
pub struct HookError(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_errors_are_recoverable() {
        assert!(PipelineError::transform("decay", "boom").is_recoverable());
        assert!(PipelineError::StepTimeout {
            transformer: "embed".into(),
            timeout: Duration::from_millis(5),
        }
        .is_recoverable());
    }

    #[test]
    fn test_other_errors_are_fatal() {
        assert!(!PipelineError::InvalidConfig("x".into()).is_recoverable());
        assert!(!PipelineError::InvariantViolation("x".into()).is_recoverable());
        assert!(!PipelineError::Other("x".into()).is_recoverable());
    }

    #[test]
    fn test_anyhow_conversion() {
        let err: PipelineError = anyhow::anyhow!("upstream broke").into();
        assert!(matches!(err, PipelineError::Other(ref m) if m == "upstream broke"));
    }

    #[test]
    fn test_display_names_transformer() {
        let err = PipelineError::transform("semantic_prune", "query embedding missing");
        assert_eq!(
            err.to_string(),
            "Transformer 'semantic_prune' failed: query embedding missing"
        );
    }
}
