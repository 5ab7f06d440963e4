//! Engine contracts.
//!
//! All traits are synchronous: decoding is CPU-bound work that the caller is
//! expected to run on a worker executor, never on the connection thread.

use std::sync::Arc;

use crate::error::Result;

/// A completed speech segment drained from a voice activity detector.
#[derive(Debug, Clone)]
pub struct VoiceSegment {
    /// Offset of the first sample, relative to the detector's input stream.
    pub start: usize,
    /// The segment's samples in [-1, 1].
    pub samples: Vec<f32>,
}

/// Windowed voice activity detection.
///
/// Callers feed fixed-size float windows via [`accept_waveform`] and poll
/// [`is_speech_detected`] for the in-speech flag. Completed segments queue up
/// internally and are drained with [`pop_segment`].
///
/// [`accept_waveform`]: VoiceActivity::accept_waveform
/// [`is_speech_detected`]: VoiceActivity::is_speech_detected
/// [`pop_segment`]: VoiceActivity::pop_segment
pub trait VoiceActivity: Send {
    /// Feeds one analysis window.
    fn accept_waveform(&mut self, window: &[f32]);

    /// True while the detector is inside a speech run.
    fn is_speech_detected(&self) -> bool;

    /// Removes and returns the oldest completed segment, if any.
    fn pop_segment(&mut self) -> Option<VoiceSegment>;
}

/// A decode stream of an offline recognizer. One stream per utterance.
pub trait OfflineStream: Send {
    /// Appends audio to the utterance.
    fn accept_waveform(&mut self, sample_rate: u32, samples: &[f32]);

    /// Decodes everything fed so far.
    fn decode(&mut self) -> Result<()>;

    /// The current hypothesis.
    fn text(&self) -> String;
}

/// Whole-utterance recognizer combined with an external VAD to simulate
/// streaming. Streams are cheap; decoding is re-entrant on a fresh stream.
pub trait OfflineRecognizer: Send {
    fn create_stream(&self) -> Result<Box<dyn OfflineStream>>;
}

/// A decode stream of an online recognizer.
pub trait OnlineStream: Send {
    /// Appends audio.
    fn accept_waveform(&mut self, sample_rate: u32, samples: &[f32]);

    /// True when enough feature frames are buffered to decode.
    fn is_ready(&self) -> bool;

    /// Runs one decode step.
    fn decode(&mut self) -> Result<()>;

    /// True when the built-in endpointer marks the end of the utterance.
    fn is_endpoint(&self) -> bool;

    /// Resets the stream after an endpoint, keeping the model state warm.
    fn reset(&mut self);

    /// The current hypothesis.
    fn text(&self) -> String;
}

/// Streaming recognizer with built-in endpointing.
pub trait OnlineRecognizer: Send {
    fn create_stream(&self) -> Result<Box<dyn OnlineStream>>;
}

/// Adds punctuation to a final hypothesis. Callers fall back to the input
/// text when this fails.
pub trait Punctuator: Send + Sync {
    fn add_punctuation(&self, text: &str) -> Result<String>;
}

/// Extracts a fixed-dimension speaker embedding from audio.
pub trait EmbeddingExtractor: Send + Sync {
    /// The embedding dimension this extractor produces.
    fn dim(&self) -> usize;

    /// Computes the embedding for the given samples.
    fn compute(&self, sample_rate: u32, samples: &[f32]) -> Result<Vec<f32>>;
}

/// Counts distinct speakers in an audio clip. Used by enrollment to reject
/// multi-speaker recordings.
pub trait SpeakerCounter: Send + Sync {
    fn count_speakers(&self, sample_rate: u32, samples: &[f32]) -> Result<usize>;
}

/// The two decoding modes a session can run in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderKind {
    /// Offline recognizer gated by an external VAD.
    OfflineVad,
    /// Online recognizer with built-in endpointing.
    Online,
}

/// Per-session options derived from the client's `Begin` payload.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Sample rate of the inbound audio.
    pub sample_rate: u32,
    /// Apply inverse text normalization.
    pub use_itn: bool,
    /// Client-requested sentence silence in ms; applied to the VAD only when
    /// above the 50 ms floor.
    pub sentence_silence_ms: Option<u32>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            use_itn: true,
            sentence_silence_ms: None,
        }
    }
}

/// The model handles owned by one session. The session only ever branches on
/// this enum, never on a concrete model type.
pub enum SessionDecoder {
    OfflineVad {
        vad: Box<dyn VoiceActivity>,
        recognizer: Box<dyn OfflineRecognizer>,
    },
    Online {
        recognizer: Box<dyn OnlineRecognizer>,
    },
}

impl SessionDecoder {
    pub fn kind(&self) -> DecoderKind {
        match self {
            SessionDecoder::OfflineVad { .. } => DecoderKind::OfflineVad,
            SessionDecoder::Online { .. } => DecoderKind::Online,
        }
    }
}

/// Builds per-session decoders for a configured model stack.
///
/// A factory is shared by all sessions; the decoders it hands out are owned
/// exclusively by one session and dropped on close.
pub trait EngineFactory: Send + Sync {
    /// The decoding mode this factory produces.
    fn kind(&self) -> DecoderKind;

    /// Creates the decoder handles for one session.
    fn create_decoder(&self, opts: &SessionOptions) -> Result<SessionDecoder>;

    /// The shared punctuator, if one is configured.
    fn punctuator(&self) -> Option<Arc<dyn Punctuator>>;
}
