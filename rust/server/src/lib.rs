//! WebSocket streaming speech-recognition server.
//!
//! Clients open a WebSocket, send a JSON `Begin` control message, stream raw
//! PCM (s16le mono 16 kHz) binary frames, and receive a time-ordered JSON
//! event sequence: `Started`, then per sentence `SentenceBegin`, partial
//! `Result`s and a final `SentenceEnd`, then `Completed` after `End`:
//!
//! ```text
//! Started (SentenceBegin Result* SentenceEnd)* Completed?
//! ```
//!
//! # Architecture
//!
//! Two executors split the work: a single-threaded control runtime owns the
//! accept loop, frame routing and every outbound send (the send path of one
//! connection is a single ordered lane), while a multi-threaded work runtime
//! runs the decode-heavy session pipeline and speaker identification. Binary
//! frames travel through a per-session queue onto the work runtime, so a
//! session observes them in arrival order without ever blocking the control
//! thread. A reaper on the work runtime closes idle connections.
//!
//! Recognition engines are reached only through the
//! [`zasr_recognizer::EngineFactory`] seam; finalized sentences can be tagged
//! with a speaker through [`zasr_voiceprint::SpeakerIdentifier`].

mod config;
mod engines;
mod error;
pub mod protocol;
mod runtime;
mod server;
mod session;

pub use config::{ServerConfig, SpeakerIdConfig};
pub use engines::build_factory;
pub use error::{Result, ServerError};
pub use runtime::Executors;
pub use server::ZasrServer;
pub use session::{ClientConfig, Outbound, PipelineConfig, Session, SessionState, TextAction};
