//! Error types for the server.

use thiserror::Error;

/// Result type alias for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

/// Error type for server operations.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Invalid or incomplete configuration.
    #[error("config error: {0}")]
    Config(String),

    /// IO error (bind, accept).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// YAML config file error.
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Error from a recognition engine.
    #[error(transparent)]
    Recognizer(#[from] zasr_recognizer::RecognizerError),

    /// Error from the voice-print subsystem.
    #[error(transparent)]
    VoicePrint(#[from] zasr_voiceprint::VoicePrintError),
}
