//! Nearest-neighbour face matching over stored embeddings.
//!
//! A linear cosine-similarity scan. Galleries are expected to stay in the
//! hundreds of entries, so there is no index structure.

use crate::types::{Embedding, FaceEmbeddingRecord, MatchError, Verdict};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Best-scoring record for a query.
#[derive(Debug, Clone, PartialEq)]
pub struct Match {
    pub record: FaceEmbeddingRecord,
    /// Cosine similarity in [-1, 1].
    pub score: f32,
}

/// In-memory gallery of face embeddings with a fixed dimension.
///
/// Scans take a read lock and may run concurrently; inserts and removals
/// take the write lock.
#[derive(Debug)]
pub struct EmbeddingMatcher {
    dim: usize,
    records: RwLock<Vec<FaceEmbeddingRecord>>,
}

impl EmbeddingMatcher {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            records: RwLock::new(Vec::new()),
        }
    }

    /// Build a matcher pre-populated with `records`, rejecting any of the
    /// wrong dimension.
    pub fn with_records(
        dim: usize,
        records: impl IntoIterator<Item = FaceEmbeddingRecord>,
    ) -> Result<Self, MatchError> {
        let matcher = Self::new(dim);
        {
            let mut guard = matcher.write();
            for record in records {
                matcher.check_len(&record.embedding)?;
                guard.push(record);
            }
        }
        Ok(matcher)
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Snapshot of all records in insertion order.
    pub fn records(&self) -> Vec<FaceEmbeddingRecord> {
        self.read().clone()
    }

    /// Append a record. Duplicates are allowed.
    pub fn add_record(
        &self,
        person_id: i64,
        person_name: impl Into<String>,
        embedding: Embedding,
    ) -> Result<(), MatchError> {
        self.check_len(&embedding)?;
        self.write().push(FaceEmbeddingRecord {
            person_id,
            person_name: person_name.into(),
            embedding,
        });
        Ok(())
    }

    /// Scan every record and return the highest-scoring one, or `None` when
    /// the gallery is empty. The first record wins a tie.
    pub fn nearest(&self, query: &Embedding) -> Result<Option<Match>, MatchError> {
        self.check_len(query)?;

        let records = self.read();
        let mut best: Option<(usize, f32)> = None;
        for (i, record) in records.iter().enumerate() {
            let score = query.similarity(&record.embedding)?;
            if best.map_or(true, |(_, best_score)| score > best_score) {
                best = Some((i, score));
            }
        }

        Ok(best.map(|(i, score)| Match {
            record: records[i].clone(),
            score,
        }))
    }

    /// Nearest match judged against `threshold`. Only a score strictly
    /// above the threshold counts as recognized.
    pub fn classify(&self, query: &Embedding, threshold: f32) -> Result<Verdict, MatchError> {
        let verdict = match self.nearest(query)? {
            Some(m) if m.score > threshold => Verdict::Recognized {
                person_id: m.record.person_id,
                person_name: m.record.person_name,
                score: m.score,
            },
            Some(m) => Verdict::Unknown {
                best_score: Some(m.score),
            },
            None => Verdict::Unknown { best_score: None },
        };
        Ok(verdict)
    }

    /// Delete every record of `person_id`; returns how many were removed.
    pub fn remove_records(&self, person_id: i64) -> usize {
        let mut records = self.write();
        let before = records.len();
        records.retain(|r| r.person_id != person_id);
        let removed = before - records.len();
        tracing::debug!(person_id, removed, "matcher: removed records");
        removed
    }

    fn check_len(&self, embedding: &Embedding) -> Result<(), MatchError> {
        if embedding.len() != self.dim {
            return Err(MatchError::LengthMismatch {
                expected: self.dim,
                actual: embedding.len(),
            });
        }
        Ok(())
    }

    // A panicking writer cannot leave the Vec half-updated, so poisoned
    // locks are recovered rather than propagated.
    fn read(&self) -> RwLockReadGuard<'_, Vec<FaceEmbeddingRecord>> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<FaceEmbeddingRecord>> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }
}
