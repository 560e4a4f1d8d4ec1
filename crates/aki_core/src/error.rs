//! Error types for aki_core.

use thiserror::Error;

/// Result type alias using [`CoreError`].
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised while validating inputs and feature metadata.
#[derive(Error, Debug)]
pub enum CoreError {
    /// An input array does not have the shape the feature layout requires.
    #[error("Invalid shape for {input}: expected {expected}, got {got}")]
    InvalidShape {
        /// Name of the offending input.
        input: String,
        /// Expected shape description.
        expected: String,
        /// Actual shape description.
        got: String,
    },

    /// A batch holds no samples.
    #[error("Empty batch: inputs hold no samples")]
    EmptyBatch,

    /// The feature layout itself is inconsistent.
    #[error("Invalid feature layout: {0}")]
    InvalidLayout(String),

    /// Inputs of one batch disagree on the batch size.
    #[error("Batch size mismatch: {input} has {got} samples, expected {expected}")]
    BatchMismatch {
        /// Name of the offending input.
        input: String,
        /// Batch size of the first input.
        expected: usize,
        /// Batch size of the offending input.
        got: usize,
    },

    /// Column metadata does not cover the feature axis it names.
    #[error("Column metadata for {input}: expected {expected} names, got {got}")]
    ColumnCount {
        /// Name of the input the columns describe.
        input: String,
        /// Number of features on that axis.
        expected: usize,
        /// Number of names supplied.
        got: usize,
    },

    /// Tensor data could not be read back into host memory.
    #[error("Tensor data error: {0}")]
    TensorData(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
