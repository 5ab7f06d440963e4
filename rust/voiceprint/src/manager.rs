//! In-memory embedding registry with cosine-similarity search.

use crate::error::{Result, VoicePrintError};

struct Entry {
    name: String,
    embedding: Vec<f32>,
}

/// Holds the L2-normalized embedding of every registered speaker and answers
/// nearest-name queries. Registration is keyed by human name; a name may be
/// re-registered to replace its embedding.
pub struct EmbeddingManager {
    dim: usize,
    entries: Vec<Entry>,
}

fn l2_normalize(v: &[f32]) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm < 1e-9 {
        return v.to_vec();
    }
    v.iter().map(|x| x / norm).collect()
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

impl EmbeddingManager {
    /// Creates a manager for embeddings of the given dimension.
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            entries: Vec::new(),
        }
    }

    /// The embedding dimension this manager accepts.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of registered speakers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no speaker is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registers (or replaces) a speaker's embedding.
    pub fn register(&mut self, name: &str, embedding: &[f32]) -> Result<()> {
        if embedding.len() != self.dim {
            return Err(VoicePrintError::DimensionMismatch {
                expected: self.dim,
                got: embedding.len(),
            });
        }
        let normalized = l2_normalize(embedding);
        if let Some(entry) = self.entries.iter_mut().find(|e| e.name == name) {
            entry.embedding = normalized;
        } else {
            self.entries.push(Entry {
                name: name.to_string(),
                embedding: normalized,
            });
        }
        Ok(())
    }

    /// Removes a speaker. Returns false when the name is not registered.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.name != name);
        self.entries.len() != before
    }

    /// Returns the name whose embedding is most similar, when the cosine
    /// similarity reaches `threshold`.
    pub fn search(&self, embedding: &[f32], threshold: f32) -> Option<&str> {
        if embedding.len() != self.dim {
            return None;
        }
        let probe = l2_normalize(embedding);
        let mut best: Option<(&str, f32)> = None;
        for entry in &self.entries {
            let sim = dot(&probe, &entry.embedding);
            if best.map_or(true, |(_, b)| sim > b) {
                best = Some((&entry.name, sim));
            }
        }
        match best {
            Some((name, sim)) if sim >= threshold => Some(name),
            _ => None,
        }
    }

    /// True when `embedding` matches the named speaker at `threshold`.
    pub fn verify(&self, name: &str, embedding: &[f32], threshold: f32) -> bool {
        if embedding.len() != self.dim {
            return false;
        }
        let probe = l2_normalize(embedding);
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| dot(&probe, &e.embedding) >= threshold)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_picks_best_match_above_threshold() {
        let mut mgr = EmbeddingManager::new(3);
        mgr.register("alice", &[1.0, 0.0, 0.0]).unwrap();
        mgr.register("bob", &[0.0, 1.0, 0.0]).unwrap();

        assert_eq!(mgr.search(&[0.9, 0.1, 0.0], 0.75), Some("alice"));
        assert_eq!(mgr.search(&[0.1, 2.0, 0.0], 0.75), Some("bob"));
        // equidistant from both, below threshold
        assert_eq!(mgr.search(&[0.7, 0.7, 0.0], 0.75), None);
        assert_eq!(mgr.search(&[0.0, 0.0, 1.0], 0.75), None);
    }

    #[test]
    fn register_rejects_wrong_dimension() {
        let mut mgr = EmbeddingManager::new(4);
        assert!(matches!(
            mgr.register("alice", &[1.0, 0.0]),
            Err(VoicePrintError::DimensionMismatch { expected: 4, got: 2 })
        ));
    }

    #[test]
    fn register_same_name_replaces() {
        let mut mgr = EmbeddingManager::new(2);
        mgr.register("alice", &[1.0, 0.0]).unwrap();
        mgr.register("alice", &[0.0, 1.0]).unwrap();
        assert_eq!(mgr.len(), 1);
        assert_eq!(mgr.search(&[0.0, 1.0], 0.9), Some("alice"));
    }

    #[test]
    fn verify_is_per_name() {
        let mut mgr = EmbeddingManager::new(2);
        mgr.register("alice", &[1.0, 0.0]).unwrap();
        mgr.register("bob", &[0.0, 1.0]).unwrap();

        assert!(mgr.verify("alice", &[0.95, 0.05], 0.75));
        assert!(!mgr.verify("bob", &[0.95, 0.05], 0.75));
        assert!(!mgr.verify("carol", &[0.95, 0.05], 0.0));
    }

    #[test]
    fn remove_unregisters() {
        let mut mgr = EmbeddingManager::new(2);
        mgr.register("alice", &[1.0, 0.0]).unwrap();
        assert!(mgr.remove("alice"));
        assert!(!mgr.remove("alice"));
        assert_eq!(mgr.search(&[1.0, 0.0], 0.5), None);
    }
}
