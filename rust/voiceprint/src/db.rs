//! On-disk voice-print database.
//!
//! Layout under the database root:
//! - `voice-prints.yaml`: the index
//! - `embeddings/<id>.bin`: one blob per record, `i32` LE dimension followed
//!   by that many `f32` LE values
//! - `samples/<id>/`: optional copies of enrollment audio

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Result, VoicePrintError};

const INDEX_FILE: &str = "voice-prints.yaml";
const DB_VERSION: &str = "1.0";

/// Returns the current time as an ISO-8601 UTC string.
pub(crate) fn now_timestamp() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

fn default_unknown() -> String {
    "unknown".to_string()
}

/// Free-form metadata attached to an enrolled speaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoicePrintMeta {
    #[serde(default = "default_unknown")]
    pub gender: String,
    #[serde(default = "default_unknown")]
    pub language: String,
    #[serde(default)]
    pub notes: String,
}

impl Default for VoicePrintMeta {
    fn default() -> Self {
        Self {
            gender: default_unknown(),
            language: default_unknown(),
            notes: String::new(),
        }
    }
}

/// An enrolled speaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoicePrintRecord {
    /// Store-issued id, `speaker-N`.
    pub id: String,
    /// Human name.
    pub name: String,
    /// ISO-8601 creation time.
    pub created_at: String,
    /// ISO-8601 last-update time.
    pub updated_at: String,
    /// Embedding blob path relative to the database root.
    pub embedding_file: String,
    /// Embedding dimension.
    pub embedding_dim: usize,
    /// Number of audio samples used at enrollment.
    pub num_samples: usize,
    /// Paths of the enrollment audio files.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub audio_samples: Vec<String>,
    #[serde(default)]
    pub metadata: VoicePrintMeta,
}

/// Tracking metadata for an auto-tracked speaker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnknownMeta {
    #[serde(default)]
    pub last_seen: String,
    #[serde(default)]
    pub avg_confidence: f32,
}

/// An automatically tracked, not-yet-enrolled speaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnknownSpeaker {
    /// Store-issued id, `unknown-N`.
    pub id: String,
    /// ISO-8601 first-seen time.
    pub first_seen: String,
    /// Embedding blob path relative to the database root.
    pub embedding_file: String,
    /// Embedding dimension.
    pub embedding_dim: usize,
    /// How many times this voice has been observed.
    pub occurrence_count: u32,
    #[serde(default)]
    pub metadata: UnknownMeta,
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexFile {
    version: String,
    created_at: String,
    updated_at: String,
    #[serde(default)]
    voice_prints: Vec<VoicePrintRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    unknown_speakers: Vec<UnknownSpeaker>,
}

/// The voice-print database.
///
/// All mutations touch the in-memory maps; [`VoicePrintDb::save`] rewrites
/// the index. Embedding blobs are written/deleted eagerly so the directory
/// never references a missing blob after a successful call.
pub struct VoicePrintDb {
    root: PathBuf,
    version: String,
    created_at: String,
    updated_at: String,
    voice_prints: BTreeMap<String, VoicePrintRecord>,
    unknown_speakers: BTreeMap<String, UnknownSpeaker>,
    next_speaker_num: u32,
    next_unknown_num: u32,
}

impl VoicePrintDb {
    /// Opens a database at `root`. `~` is expanded; an empty path selects
    /// `~/.zasr/voice-prints` (or `/tmp/zasr/voice-prints` without a home
    /// directory). Nothing is read until [`VoicePrintDb::load`].
    pub fn open(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        let root = if root.as_os_str().is_empty() {
            dirs::home_dir()
                .map(|h| h.join(".zasr").join("voice-prints"))
                .unwrap_or_else(|| PathBuf::from("/tmp/zasr/voice-prints"))
        } else {
            expand_tilde(root)
        };
        let now = now_timestamp();
        Self {
            root,
            version: DB_VERSION.to_string(),
            created_at: now.clone(),
            updated_at: now,
            voice_prints: BTreeMap::new(),
            unknown_speakers: BTreeMap::new(),
            next_speaker_num: 1,
            next_unknown_num: 1,
        }
    }

    /// The database root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the YAML index.
    pub fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    /// Path of the embeddings directory.
    pub fn embeddings_dir(&self) -> PathBuf {
        self.root.join("embeddings")
    }

    /// Path of the samples directory.
    pub fn samples_dir(&self) -> PathBuf {
        self.root.join("samples")
    }

    fn create_directories(&self) -> Result<()> {
        fs::create_dir_all(self.embeddings_dir())?;
        fs::create_dir_all(self.samples_dir())?;
        Ok(())
    }

    /// Loads the index, creating a fresh directory structure when none
    /// exists. Id counters advance past any persisted `speaker-N` /
    /// `unknown-N` maxima.
    pub fn load(&mut self) -> Result<()> {
        let index_path = self.index_path();
        if !index_path.exists() {
            info!(path = %index_path.display(), "voice-print index not found, creating new database");
            return self.create_directories();
        }

        let text = fs::read_to_string(&index_path)?;
        let index: IndexFile = serde_yaml::from_str(&text)?;

        self.version = index.version;
        self.created_at = index.created_at;
        self.updated_at = index.updated_at;

        for record in index.voice_prints {
            if let Some(num) = parse_id_num(&record.id, "speaker-") {
                self.next_speaker_num = self.next_speaker_num.max(num + 1);
            }
            self.voice_prints.insert(record.id.clone(), record);
        }
        for unknown in index.unknown_speakers {
            if let Some(num) = parse_id_num(&unknown.id, "unknown-") {
                self.next_unknown_num = self.next_unknown_num.max(num + 1);
            }
            self.unknown_speakers.insert(unknown.id.clone(), unknown);
        }

        info!(
            speakers = self.voice_prints.len(),
            unknown = self.unknown_speakers.len(),
            path = %index_path.display(),
            "loaded voice-print database"
        );
        Ok(())
    }

    /// Writes the index. `updated_at` is refreshed.
    pub fn save(&mut self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        self.updated_at = now_timestamp();
        let index = IndexFile {
            version: self.version.clone(),
            created_at: self.created_at.clone(),
            updated_at: self.updated_at.clone(),
            voice_prints: self.voice_prints.values().cloned().collect(),
            unknown_speakers: self.unknown_speakers.values().cloned().collect(),
        };
        let text = serde_yaml::to_string(&index)?;
        fs::write(self.index_path(), text)?;
        Ok(())
    }

    /// Adds or replaces a record and writes its embedding blob.
    pub fn add(&mut self, record: VoicePrintRecord, embedding: &[f32]) -> Result<()> {
        self.create_directories()?;
        let path = self.root.join(&record.embedding_file);
        write_embedding(&path, embedding)?;
        info!(id = %record.id, name = %record.name, "added voice print");
        self.voice_prints.insert(record.id.clone(), record);
        self.updated_at = now_timestamp();
        Ok(())
    }

    /// Removes a record and deletes its embedding blob.
    pub fn remove(&mut self, speaker_id: &str) -> Result<VoicePrintRecord> {
        let record = self
            .voice_prints
            .remove(speaker_id)
            .ok_or_else(|| VoicePrintError::NotFound(speaker_id.to_string()))?;
        let path = self.root.join(&record.embedding_file);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        self.updated_at = now_timestamp();
        info!(id = %speaker_id, "removed voice print");
        Ok(record)
    }

    /// Renames a speaker.
    pub fn rename(&mut self, speaker_id: &str, new_name: &str) -> Result<()> {
        let record = self
            .voice_prints
            .get_mut(speaker_id)
            .ok_or_else(|| VoicePrintError::NotFound(speaker_id.to_string()))?;
        record.name = new_name.to_string();
        record.updated_at = now_timestamp();
        self.updated_at = record.updated_at.clone();
        Ok(())
    }

    /// Looks up a record by id.
    pub fn get(&self, speaker_id: &str) -> Option<&VoicePrintRecord> {
        self.voice_prints.get(speaker_id)
    }

    /// True when the id is enrolled.
    pub fn contains(&self, speaker_id: &str) -> bool {
        self.voice_prints.contains_key(speaker_id)
    }

    /// All enrolled records, ordered by id.
    pub fn records(&self) -> impl Iterator<Item = &VoicePrintRecord> {
        self.voice_prints.values()
    }

    /// Number of enrolled speakers.
    pub fn len(&self) -> usize {
        self.voice_prints.len()
    }

    /// True when no speaker is enrolled.
    pub fn is_empty(&self) -> bool {
        self.voice_prints.is_empty()
    }

    /// All auto-tracked unknown speakers, ordered by id.
    pub fn unknowns(&self) -> impl Iterator<Item = &UnknownSpeaker> {
        self.unknown_speakers.values()
    }

    /// Reads a record's embedding blob.
    pub fn load_embedding(&self, speaker_id: &str) -> Result<Vec<f32>> {
        let record = self
            .voice_prints
            .get(speaker_id)
            .ok_or_else(|| VoicePrintError::NotFound(speaker_id.to_string()))?;
        read_embedding(&self.root.join(&record.embedding_file))
    }

    /// Allocates the next free `speaker-N` id.
    pub fn generate_speaker_id(&mut self) -> String {
        loop {
            let id = format!("speaker-{}", self.next_speaker_num);
            self.next_speaker_num += 1;
            if !self.voice_prints.contains_key(&id) {
                return id;
            }
        }
    }

    /// Registers a new unknown speaker and persists its embedding.
    pub fn add_unknown(&mut self, embedding: &[f32]) -> Result<String> {
        self.create_directories()?;
        let id = loop {
            let id = format!("unknown-{}", self.next_unknown_num);
            self.next_unknown_num += 1;
            if !self.unknown_speakers.contains_key(&id) {
                break id;
            }
        };

        let embedding_file = format!("embeddings/{id}.bin");
        write_embedding(&self.root.join(&embedding_file), embedding)?;

        let now = now_timestamp();
        self.unknown_speakers.insert(
            id.clone(),
            UnknownSpeaker {
                id: id.clone(),
                first_seen: now.clone(),
                embedding_file,
                embedding_dim: embedding.len(),
                occurrence_count: 1,
                metadata: UnknownMeta {
                    last_seen: now.clone(),
                    avg_confidence: 0.0,
                },
            },
        );
        self.updated_at = now;
        info!(id = %id, "added unknown speaker");
        Ok(id)
    }

    /// Records another occurrence of an unknown speaker, folding the
    /// confidence into the running mean.
    pub fn touch_unknown(&mut self, unknown_id: &str, confidence: f32) {
        let Some(unknown) = self.unknown_speakers.get_mut(unknown_id) else {
            return;
        };
        unknown.occurrence_count += 1;
        unknown.metadata.last_seen = now_timestamp();
        let count = unknown.occurrence_count as f32;
        unknown.metadata.avg_confidence =
            (unknown.metadata.avg_confidence * (count - 1.0) + confidence) / count;
        self.updated_at = now_timestamp();
    }

    /// Checks that every referenced embedding blob exists.
    pub fn validate(&self) -> bool {
        let mut valid = true;
        for record in self.voice_prints.values() {
            let path = self.root.join(&record.embedding_file);
            if !path.exists() {
                warn!(id = %record.id, path = %path.display(), "missing embedding blob");
                valid = false;
            }
        }
        for unknown in self.unknown_speakers.values() {
            let path = self.root.join(&unknown.embedding_file);
            if !path.exists() {
                warn!(id = %unknown.id, path = %path.display(), "missing embedding blob");
                valid = false;
            }
        }
        valid
    }
}

fn parse_id_num(id: &str, prefix: &str) -> Option<u32> {
    id.strip_prefix(prefix)?.parse().ok()
}

/// Writes an embedding blob: `i32` LE dimension, then `f32` LE values.
pub fn write_embedding(path: &Path, embedding: &[f32]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut buf = BytesMut::with_capacity(4 + embedding.len() * 4);
    buf.put_i32_le(embedding.len() as i32);
    for v in embedding {
        buf.put_f32_le(*v);
    }
    fs::write(path, &buf)?;
    Ok(())
}

/// Reads an embedding blob written by [`write_embedding`].
pub fn read_embedding(path: &Path) -> Result<Vec<f32>> {
    let data = fs::read(path)?;
    let mut buf = &data[..];
    if buf.len() < 4 {
        return Err(VoicePrintError::InvalidAudio(format!(
            "embedding blob too short: {}",
            path.display()
        )));
    }
    let dim = buf.get_i32_le();
    if dim < 0 || buf.len() != dim as usize * 4 {
        return Err(VoicePrintError::InvalidAudio(format!(
            "embedding blob corrupt: {}",
            path.display()
        )));
    }
    let mut embedding = Vec::with_capacity(dim as usize);
    for _ in 0..dim {
        embedding.push(buf.get_f32_le());
    }
    Ok(embedding)
}
