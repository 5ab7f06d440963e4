//! Error types for recognizer engines.

use thiserror::Error;

/// Result type alias for recognizer operations.
pub type Result<T> = std::result::Result<T, RecognizerError>;

/// Error type for recognizer operations.
#[derive(Debug, Error)]
pub enum RecognizerError {
    /// A model could not be loaded or instantiated.
    #[error("model load failed: {0}")]
    ModelLoad(String),

    /// Decoding failed inside an engine.
    #[error("decode failed: {0}")]
    Decode(String),

    /// Embedding extraction failed (e.g. audio too short).
    #[error("embedding extraction failed: {0}")]
    Embedding(String),

    /// The requested configuration is not supported by this engine set.
    #[error("unsupported configuration: {0}")]
    UnsupportedConfig(String),

    /// IO error while reading model files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
