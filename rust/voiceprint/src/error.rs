//! Error types for the voice-print store.

use thiserror::Error;

/// Result type alias for voice-print operations.
pub type Result<T> = std::result::Result<T, VoicePrintError>;

/// Error type for voice-print operations.
#[derive(Debug, Error)]
pub enum VoicePrintError {
    /// IO error on the store directory or an embedding blob.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Index file could not be parsed or written.
    #[error("index error: {0}")]
    Index(#[from] serde_yaml::Error),

    /// An embedding's dimension does not match the extractor's.
    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    /// The requested speaker does not exist.
    #[error("speaker not found: {0}")]
    NotFound(String),

    /// An enrollment recording contains more than one speaker.
    #[error("multiple speakers detected: {0}")]
    MultipleSpeakers(usize),

    /// No usable embedding could be extracted from the given audio.
    #[error("no embedding extracted: {0}")]
    NoEmbedding(String),

    /// An audio file could not be read or has an unusable format.
    #[error("invalid audio: {0}")]
    InvalidAudio(String),

    /// Error from the embedding extractor.
    #[error(transparent)]
    Recognizer(#[from] zasr_recognizer::RecognizerError),
}
