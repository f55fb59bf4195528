//! Error type shared by model construction, training and checkpointing.

use std::io;

/// Errors raised while building, training or persisting a model.
#[derive(thiserror::Error, Debug)]
pub enum ModelError {
    /// The execution backend lacks a primitive the topology needs.
    #[error("Backend error: {0}")]
    Backend(String),

    /// Invalid architecture, training or model configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A tensor or buffer did not have the expected shape.
    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    Shape {
        /// Shape the operation expected.
        expected: Vec<usize>,
        /// Shape it received.
        actual: Vec<usize>,
    },

    /// A class label outside `[0, num_classes)`.
    #[error("Label {label} out of range for {num_classes} classes")]
    Label {
        /// Offending label.
        label: usize,
        /// Number of classes of the model.
        num_classes: usize,
    },

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding or decoding of a checkpoint, batch or config failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The batch source failed to produce a batch.
    #[error("Batch source error: {0}")]
    BatchSource(String),

    /// A checkpoint did not match the model it was loaded into.
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),
}

impl From<serde_json::Error> for ModelError {
    fn from(err: serde_json::Error) -> Self {
        ModelError::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for ModelError {
    fn from(err: bincode::Error) -> Self {
        ModelError::Serialization(err.to_string())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ModelError>;

pub(crate) fn config_error(message: impl Into<String>) -> ModelError {
    ModelError::Config(message.into())
}
