//! Model and engine configuration types.
//!
//! These mirror the numeric surface of the underlying model stack so that a
//! concrete backend can be wired in without touching the session pipeline.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Which recognizer family a server instance runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecognizerType {
    /// Offline SenseVoice model gated by an external VAD (simulated streaming).
    #[default]
    SenseVoice,
    /// True streaming transducer (encoder/decoder/joiner triplet).
    StreamingZipformer,
    /// True streaming attention model (encoder/decoder pair).
    StreamingParaformer,
}

impl RecognizerType {
    /// Returns the string form used on the command line and in YAML config.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecognizerType::SenseVoice => "sense-voice",
            RecognizerType::StreamingZipformer => "streaming-zipformer",
            RecognizerType::StreamingParaformer => "streaming-paraformer",
        }
    }

    /// Parses the command-line / YAML spelling.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sense-voice" => Some(RecognizerType::SenseVoice),
            "streaming-zipformer" => Some(RecognizerType::StreamingZipformer),
            "streaming-paraformer" => Some(RecognizerType::StreamingParaformer),
            _ => None,
        }
    }

    /// True for the families that stream natively (no external VAD).
    pub fn is_online(&self) -> bool {
        !matches!(self, RecognizerType::SenseVoice)
    }
}

impl fmt::Display for RecognizerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for RecognizerType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RecognizerType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        RecognizerType::parse(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown recognizer type: {s}")))
    }
}

/// Voice activity detector configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadModelConfig {
    /// Path to the VAD model file.
    #[serde(default)]
    pub model: PathBuf,
    /// Speech probability threshold.
    #[serde(default = "default_vad_threshold")]
    pub threshold: f32,
    /// Trailing silence (seconds) that closes a segment.
    #[serde(default = "default_min_silence")]
    pub min_silence_duration: f32,
    /// Shortest run (seconds) accepted as speech.
    #[serde(default = "default_min_speech")]
    pub min_speech_duration: f32,
    /// Hard cap (seconds) on a single segment.
    #[serde(default = "default_max_speech")]
    pub max_speech_duration: f32,
    /// Sample rate the detector runs at.
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    /// Analysis window size in milliseconds.
    #[serde(default = "default_window_ms")]
    pub window_size_ms: f32,
}

fn default_vad_threshold() -> f32 {
    0.5
}
fn default_min_silence() -> f32 {
    0.1
}
fn default_min_speech() -> f32 {
    0.25
}
fn default_max_speech() -> f32 {
    8.0
}
fn default_sample_rate() -> u32 {
    16000
}
fn default_window_ms() -> f32 {
    30.0
}

impl Default for VadModelConfig {
    fn default() -> Self {
        Self {
            model: PathBuf::new(),
            threshold: default_vad_threshold(),
            min_silence_duration: default_min_silence(),
            min_speech_duration: default_min_speech(),
            max_speech_duration: default_max_speech(),
            sample_rate: default_sample_rate(),
            window_size_ms: default_window_ms(),
        }
    }
}

impl VadModelConfig {
    /// Window size in samples at the configured sample rate.
    pub fn window_size(&self) -> usize {
        (self.sample_rate as f32 * self.window_size_ms / 1000.0) as usize
    }
}

/// Endpoint rules for online recognizers.
///
/// Rule 1 fires on long trailing silence regardless of decoded output,
/// rule 2 on shorter trailing silence once something was decoded, rule 3
/// caps the utterance length in feature frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    #[serde(default = "default_rule1")]
    pub rule1_min_trailing_silence: f32,
    #[serde(default = "default_rule2")]
    pub rule2_min_trailing_silence: f32,
    #[serde(default = "default_rule3")]
    pub rule3_min_utterance_length: f32,
}

fn default_rule1() -> f32 {
    1.2
}
fn default_rule2() -> f32 {
    0.8
}
fn default_rule3() -> f32 {
    10.0
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            rule1_min_trailing_silence: default_rule1(),
            rule2_min_trailing_silence: default_rule2(),
            rule3_min_utterance_length: default_rule3(),
        }
    }
}

/// Offline (whole-utterance) model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineModelConfig {
    /// Path to the acoustic model.
    #[serde(default)]
    pub model: PathBuf,
    /// Path to the token table.
    #[serde(default)]
    pub tokens: PathBuf,
    /// Apply inverse text normalization to hypotheses.
    #[serde(default = "default_true")]
    pub use_itn: bool,
    /// Intra-op thread count for the model runtime.
    #[serde(default = "default_num_threads")]
    pub num_threads: usize,
}

impl Default for OfflineModelConfig {
    fn default() -> Self {
        Self {
            model: PathBuf::new(),
            tokens: PathBuf::new(),
            use_itn: true,
            num_threads: default_num_threads(),
        }
    }
}

/// Online (streaming) model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnlineModelConfig {
    /// Path to the encoder model.
    #[serde(default)]
    pub encoder: PathBuf,
    /// Path to the decoder model.
    #[serde(default)]
    pub decoder: PathBuf,
    /// Path to the joiner model (transducers only).
    #[serde(default)]
    pub joiner: Option<PathBuf>,
    /// Path to the token table.
    #[serde(default)]
    pub tokens: PathBuf,
    /// Intra-op thread count for the model runtime.
    #[serde(default = "default_num_threads")]
    pub num_threads: usize,
    /// Endpointing rules.
    #[serde(default)]
    pub endpoint: EndpointConfig,
    /// Acoustic feature dimension.
    #[serde(default = "default_feature_dim")]
    pub feature_dim: usize,
}

impl Default for OnlineModelConfig {
    fn default() -> Self {
        Self {
            encoder: PathBuf::new(),
            decoder: PathBuf::new(),
            joiner: None,
            tokens: PathBuf::new(),
            num_threads: default_num_threads(),
            endpoint: EndpointConfig::default(),
            feature_dim: default_feature_dim(),
        }
    }
}

/// Punctuation model configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PunctuationConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub model: PathBuf,
}

/// Speaker embedding model configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpeakerModelConfig {
    /// Path to the embedding model.
    #[serde(default)]
    pub model: PathBuf,
    /// Intra-op thread count.
    #[serde(default = "default_num_threads")]
    pub num_threads: usize,
}

fn default_true() -> bool {
    true
}
fn default_num_threads() -> usize {
    2
}
fn default_feature_dim() -> usize {
    80
}
