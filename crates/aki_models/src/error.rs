//! Error types for aki_models.

use thiserror::Error;

use aki_core::CoreError;

/// Result type alias using [`ModelError`].
pub type Result<T> = std::result::Result<T, ModelError>;

/// Errors raised while building the network or recording a trace.
#[derive(Error, Debug)]
pub enum ModelError {
    /// Invalid network configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A parameter snapshot does not fit the network.
    #[error("Snapshot mismatch for layer '{layer}': {reason}")]
    SnapshotMismatch {
        /// Layer name.
        layer: String,
        /// What did not fit.
        reason: String,
    },

    /// The trace was recorded out of order.
    #[error("Malformed trace: {0}")]
    MalformedTrace(String),

    /// Input validation error.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
