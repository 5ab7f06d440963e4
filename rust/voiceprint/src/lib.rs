//! Voice-print store and speaker identification.
//!
//! The on-disk store is a YAML index (`voice-prints.yaml`) next to an
//! `embeddings/` directory of binary blobs and an optional `samples/`
//! directory of enrollment audio:
//!
//! ```text
//! ~/.zasr/voice-prints/
//! ├── voice-prints.yaml
//! ├── embeddings/
//! │   ├── speaker-1.bin      # i32 LE dim + dim × f32 LE
//! │   └── unknown-1.bin
//! └── samples/
//!     └── speaker-1/
//! ```
//!
//! [`SpeakerIdentifier`] glues an [`EmbeddingExtractor`] to the store and an
//! in-memory [`EmbeddingManager`] for cosine-similarity search. Sentences
//! finalized by the server are tagged through it; the `zasr-voiceprint` CLI
//! drives enrollment over the same store.
//!
//! [`EmbeddingExtractor`]: zasr_recognizer::EmbeddingExtractor

mod db;
mod error;
mod identifier;
mod manager;
mod wav;

pub use db::{UnknownMeta, UnknownSpeaker, VoicePrintDb, VoicePrintMeta, VoicePrintRecord};
pub use error::{Result, VoicePrintError};
pub use identifier::{Identification, IdentifierConfig, SpeakerIdentifier};
pub use manager::EmbeddingManager;
pub use wav::read_wav_mono;
