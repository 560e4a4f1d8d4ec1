//! Error types for aki_explain.

use aki_core::CoreError;
use aki_models::{ModelError, OperatorKind};
use thiserror::Error;

/// Result type alias using [`ExplainError`].
pub type Result<T> = std::result::Result<T, ExplainError>;

/// Errors raised while resolving or applying a single rule.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuleError {
    /// No rule is registered for this operator kind.
    #[error("No relevance rule for operator '{0}'")]
    UnsupportedOperator(OperatorKind),

    /// The rule description is invalid.
    #[error("Invalid rule config: {0}")]
    InvalidRuleConfig(String),

    /// Relevance and activation shapes disagree.
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),
}

/// Errors raised by an explanation request.
///
/// Configuration errors are raised by [`crate::LrpEngine::new`] before any
/// tensor work; [`ExplainError::ExplanationFailed`] aborts a request with
/// no partial output.
#[derive(Error, Debug)]
pub enum ExplainError {
    /// A layer has an operator kind with no rule.
    #[error("Unsupported operator '{kind}' at layer '{layer}'")]
    UnsupportedOperator {
        /// Layer name.
        layer: String,
        /// Operator kind.
        kind: OperatorKind,
    },

    /// A rule description is invalid.
    #[error("Invalid rule config for layer '{layer}': {reason}")]
    InvalidRuleConfig {
        /// Layer name.
        layer: String,
        /// What is wrong.
        reason: String,
    },

    /// The rule list does not match the layer table one-to-one.
    #[error("{rules} rule descriptions for {layers} layers")]
    LayerCountMismatch {
        /// Number of layers.
        layers: usize,
        /// Number of rule descriptions.
        rules: usize,
    },

    /// Propagation hit a shape it cannot reconcile.
    #[error("Explanation failed in branch '{branch}' at '{operator}': {reason}")]
    ExplanationFailed {
        /// Branch being propagated.
        branch: String,
        /// Layer or fusion point.
        operator: String,
        /// What went wrong.
        reason: String,
    },

    /// Input or tensor readback error.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Model or trace error.
    #[error(transparent)]
    Model(#[from] ModelError),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ExplainError {
    /// Whether the error was raised by configuration, before any tensor work.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            ExplainError::UnsupportedOperator { .. }
                | ExplainError::InvalidRuleConfig { .. }
                | ExplainError::LayerCountMismatch { .. }
        )
    }
}
