//! Interfaces over the speech models used by the ZASR server.
//!
//! This crate defines narrow, object-safe contracts for:
//! - [`VoiceActivity`]: windowed voice activity detection with a FIFO of
//!   completed speech segments
//! - [`OfflineRecognizer`] / [`OfflineStream`]: whole-utterance decoding,
//!   one fresh stream per utterance
//! - [`OnlineRecognizer`] / [`OnlineStream`]: incremental decoding with
//!   built-in endpointing
//! - [`Punctuator`]: post-processing of final hypotheses
//! - [`EmbeddingExtractor`]: fixed-dimension speaker embeddings
//! - [`SpeakerCounter`]: speaker counting for enrollment checks
//!
//! A session obtains its decoder through an [`EngineFactory`], which hides
//! the concrete model stack behind the [`SessionDecoder`] capability set.
//! The [`sim`] module provides self-contained engines (energy VAD, scripted
//! decoders, autocorrelation embeddings) used by the test suite and for
//! running the server without model files.

mod config;
mod error;
pub mod sim;
mod traits;

pub use config::{
    EndpointConfig, OfflineModelConfig, OnlineModelConfig, PunctuationConfig, RecognizerType,
    SpeakerModelConfig, VadModelConfig,
};
pub use error::{RecognizerError, Result};
pub use traits::{
    DecoderKind, EmbeddingExtractor, EngineFactory, OfflineRecognizer, OfflineStream,
    OnlineRecognizer, OnlineStream, Punctuator, SessionDecoder, SessionOptions, SpeakerCounter,
    VoiceSegment, VoiceActivity,
};
