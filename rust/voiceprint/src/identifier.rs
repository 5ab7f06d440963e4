//! Speaker identification over the voice-print store.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};
use zasr_recognizer::{EmbeddingExtractor, SpeakerCounter};

use crate::db::{now_timestamp, VoicePrintDb, VoicePrintMeta, VoicePrintRecord};
use crate::error::{Result, VoicePrintError};
use crate::manager::EmbeddingManager;
use crate::wav::read_wav_mono;

/// Display name attached to auto-tracked speakers.
pub const UNKNOWN_SPEAKER_NAME: &str = "Unknown Speaker";

/// Configuration for [`SpeakerIdentifier`].
#[derive(Debug, Clone)]
pub struct IdentifierConfig {
    /// Database root; empty selects the default location.
    pub db_path: PathBuf,
    /// Cosine similarity a match must reach.
    pub similarity_threshold: f32,
    /// Track unmatched voices as `unknown-N` records.
    pub auto_track: bool,
}

impl Default for IdentifierConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::new(),
            similarity_threshold: 0.75,
            auto_track: true,
        }
    }
}

/// Outcome of an identification.
#[derive(Debug, Clone)]
pub struct Identification {
    /// `speaker-N` or `unknown-N`.
    pub speaker_id: String,
    /// Enrolled name, or [`UNKNOWN_SPEAKER_NAME`].
    pub speaker_name: String,
    /// Reported confidence. For a threshold match this is the configured
    /// threshold; the manager's search resolves only the name.
    pub confidence: f32,
    /// True when this call created the unknown record.
    pub is_new: bool,
}

struct Inner {
    manager: EmbeddingManager,
    db: VoicePrintDb,
}

/// Extractor + manager + database glue.
///
/// Shared between the server's sessions and the CLI; every store access goes
/// through one internal lock so writes never interleave.
pub struct SpeakerIdentifier {
    extractor: Arc<dyn EmbeddingExtractor>,
    counter: Option<Arc<dyn SpeakerCounter>>,
    config: IdentifierConfig,
    inner: Mutex<Inner>,
}

impl SpeakerIdentifier {
    pub fn new(
        extractor: Arc<dyn EmbeddingExtractor>,
        counter: Option<Arc<dyn SpeakerCounter>>,
        config: IdentifierConfig,
    ) -> Self {
        let dim = extractor.dim();
        let db = VoicePrintDb::open(&config.db_path);
        Self {
            extractor,
            counter,
            config,
            inner: Mutex::new(Inner {
                manager: EmbeddingManager::new(dim),
                db,
            }),
        }
    }

    /// The embedding dimension in play.
    pub fn dim(&self) -> usize {
        self.extractor.dim()
    }

    /// Loads the database and registers every stored embedding. Records
    /// whose dimension does not match the extractor are logged and skipped.
    pub fn load(&self) -> Result<()> {
        let dim = self.extractor.dim();
        let inner = &mut *self.inner.lock();
        inner.db.load()?;

        let records: Vec<VoicePrintRecord> = inner.db.records().cloned().collect();
        for record in records {
            let id = record.id.clone();
            if record.embedding_dim != dim {
                warn!(
                    id = %id,
                    expected = dim,
                    got = record.embedding_dim,
                    "skipping voice print with mismatched dimension"
                );
                continue;
            }
            match inner.db.load_embedding(&id) {
                Ok(embedding) => {
                    if let Err(e) = inner.manager.register(&record.name, &embedding) {
                        warn!(id = %id, error = %e, "failed to register voice print");
                    }
                }
                Err(e) => warn!(id = %id, error = %e, "failed to load embedding"),
            }
        }

        let unknowns: Vec<(String, String, usize)> = inner
            .db
            .unknowns()
            .map(|u| (u.id.clone(), u.embedding_file.clone(), u.embedding_dim))
            .collect();
        for (id, file, udim) in unknowns {
            if udim != dim {
                warn!(id = %id, expected = dim, got = udim, "skipping unknown speaker with mismatched dimension");
                continue;
            }
            match crate::db::read_embedding(&inner.db.root().join(&file)) {
                Ok(embedding) => {
                    if let Err(e) = inner.manager.register(&id, &embedding) {
                        warn!(id = %id, error = %e, "failed to register unknown speaker");
                    }
                }
                Err(e) => warn!(id = %id, error = %e, "failed to load unknown embedding"),
            }
        }

        info!(registered = inner.manager.len(), "speaker identifier loaded");
        Ok(())
    }

    fn extract_from_wav(&self, path: &Path) -> Result<Vec<f32>> {
        let (rate, samples) = read_wav_mono(path)?;
        Ok(self.extractor.compute(rate, &samples)?)
    }

    fn check_single_speaker(&self, path: &Path, force: bool) -> Result<()> {
        if force {
            return Ok(());
        }
        let Some(counter) = &self.counter else {
            return Err(VoicePrintError::InvalidAudio(format!(
                "{}: no diarization model available to verify the recording holds one speaker (use force to skip)",
                path.display()
            )));
        };
        let (rate, samples) = read_wav_mono(path)?;
        let n = counter.count_speakers(rate, &samples)?;
        if n > 1 {
            return Err(VoicePrintError::MultipleSpeakers(n));
        }
        Ok(())
    }

    /// Enrolls a speaker from one or more WAV files and returns the new
    /// `speaker-N` id. The first successfully extracted embedding is
    /// persisted; files that fail extraction are skipped with a warning.
    pub fn add_speaker(
        &self,
        name: &str,
        wav_files: &[PathBuf],
        metadata: VoicePrintMeta,
        force: bool,
    ) -> Result<String> {
        if wav_files.is_empty() {
            return Err(VoicePrintError::NoEmbedding("no audio files given".into()));
        }

        let mut embeddings = Vec::new();
        for path in wav_files {
            self.check_single_speaker(path, force)?;
            match self.extract_from_wav(path) {
                Ok(embedding) => embeddings.push(embedding),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping audio file"),
            }
        }
        let first = embeddings
            .first()
            .cloned()
            .ok_or_else(|| VoicePrintError::NoEmbedding("no file yielded an embedding".into()))?;

        let inner = &mut *self.inner.lock();
        inner.manager.register(name, &first)?;

        let id = inner.db.generate_speaker_id();
        let now = now_timestamp();
        let record = VoicePrintRecord {
            id: id.clone(),
            name: name.to_string(),
            created_at: now.clone(),
            updated_at: now,
            embedding_file: format!("embeddings/{id}.bin"),
            embedding_dim: first.len(),
            num_samples: wav_files.len(),
            audio_samples: wav_files
                .iter()
                .map(|p| p.display().to_string())
                .collect(),
            metadata,
        };
        // The persisted embedding is the first one; averaging across samples
        // is a documented enhancement.
        inner.db.add(record, &first)?;
        inner.db.save()?;

        info!(id = %id, name = %name, samples = wav_files.len(), "enrolled speaker");
        Ok(id)
    }

    /// Removes an enrolled speaker and its embedding blob.
    pub fn remove_speaker(&self, speaker_id: &str) -> Result<()> {
        let inner = &mut *self.inner.lock();
        let record = inner.db.remove(speaker_id)?;
        inner.manager.remove(&record.name);
        inner.db.save()
    }

    /// Renames an enrolled speaker, re-keying its in-memory embedding.
    pub fn rename_speaker(&self, speaker_id: &str, new_name: &str) -> Result<()> {
        let inner = &mut *self.inner.lock();
        let old_name = inner
            .db
            .get(speaker_id)
            .ok_or_else(|| VoicePrintError::NotFound(speaker_id.to_string()))?
            .name
            .clone();
        let embedding = inner.db.load_embedding(speaker_id)?;
        inner.db.rename(speaker_id, new_name)?;
        inner.manager.remove(&old_name);
        inner.manager.register(new_name, &embedding)?;
        inner.db.save()
    }

    /// Identifies the speaker of an audio segment. Returns `None` when the
    /// voice matches nobody and auto-tracking is off, or when no embedding
    /// could be extracted.
    pub fn identify_samples(&self, sample_rate: u32, samples: &[f32]) -> Option<Identification> {
        let embedding = match self.extractor.compute(sample_rate, samples) {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "embedding extraction failed");
                return None;
            }
        };
        self.match_embedding(&embedding)
    }

    /// Identifies the speaker of a WAV file.
    pub fn identify_wav(&self, path: &Path) -> Result<Option<Identification>> {
        let embedding = self.extract_from_wav(path)?;
        Ok(self.match_embedding(&embedding))
    }

    fn match_embedding(&self, embedding: &[f32]) -> Option<Identification> {
        let threshold = self.config.similarity_threshold;
        let inner = &mut *self.inner.lock();

        if let Some(name) = inner.manager.search(embedding, threshold) {
            let name = name.to_string();
            if name.starts_with("unknown-") {
                inner.db.touch_unknown(&name, threshold);
                let _ = inner.db.save();
                return Some(Identification {
                    speaker_id: name,
                    speaker_name: UNKNOWN_SPEAKER_NAME.to_string(),
                    confidence: threshold,
                    is_new: false,
                });
            }
            let speaker_id = inner
                .db
                .records()
                .find(|r| r.name == name)
                .map(|r| r.id.clone())
                .unwrap_or_default();
            info!(id = %speaker_id, name = %name, "identified speaker");
            return Some(Identification {
                speaker_id,
                speaker_name: name,
                confidence: threshold,
                is_new: false,
            });
        }

        if !self.config.auto_track {
            return None;
        }

        match inner.db.add_unknown(embedding) {
            Ok(id) => {
                if let Err(e) = inner.manager.register(&id, embedding) {
                    warn!(id = %id, error = %e, "failed to register unknown speaker");
                }
                let _ = inner.db.save();
                info!(id = %id, "tracking new unknown speaker");
                Some(Identification {
                    speaker_id: id,
                    speaker_name: UNKNOWN_SPEAKER_NAME.to_string(),
                    confidence: 0.0,
                    is_new: true,
                })
            }
            Err(e) => {
                warn!(error = %e, "failed to track unknown speaker");
                None
            }
        }
    }

    /// Verifies a WAV file against an enrolled speaker.
    pub fn verify_wav(&self, speaker_id: &str, path: &Path, threshold: Option<f32>) -> Result<bool> {
        let embedding = self.extract_from_wav(path)?;
        let threshold = threshold.unwrap_or(self.config.similarity_threshold);
        let inner = self.inner.lock();
        let name = inner
            .db
            .get(speaker_id)
            .ok_or_else(|| VoicePrintError::NotFound(speaker_id.to_string()))?
            .name
            .clone();
        Ok(inner.manager.verify(&name, &embedding, threshold))
    }

    /// All enrolled records.
    pub fn list(&self) -> Vec<VoicePrintRecord> {
        self.inner.lock().db.records().cloned().collect()
    }

    /// One enrolled record.
    pub fn info(&self, speaker_id: &str) -> Option<VoicePrintRecord> {
        self.inner.lock().db.get(speaker_id).cloned()
    }
}
