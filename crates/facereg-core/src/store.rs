//! Persistence boundary for people and their face embeddings.

use crate::types::{FaceEmbeddingRecord, PersonRecord};
use chrono::Utc;
use std::convert::Infallible;

/// What a person removal deleted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Removal {
    /// Whether the person row existed.
    pub person: bool,
    pub embeddings: usize,
}

impl Removal {
    /// Nothing was stored under the id.
    pub fn is_empty(&self) -> bool {
        !self.person && self.embeddings == 0
    }
}

/// Durable storage for registered people and their embeddings.
pub trait RecordStore {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Create a person and return the assigned id.
    fn add_person(&mut self, name: &str, num_images: u64) -> Result<i64, Self::Error>;

    /// Delete the person together with every embedding they own, as one
    /// unit: either both go or neither does.
    fn remove_person(&mut self, id: i64) -> Result<Removal, Self::Error>;

    fn people(&self) -> Result<Vec<PersonRecord>, Self::Error>;

    fn count_people(&self) -> Result<u64, Self::Error>;

    fn add_record(&mut self, record: &FaceEmbeddingRecord) -> Result<(), Self::Error>;

    /// All stored embeddings in insertion order.
    fn records(&self) -> Result<Vec<FaceEmbeddingRecord>, Self::Error>;
}

/// Non-durable store, for tests and throwaway sessions.
#[derive(Debug, Default)]
pub struct MemoryStore {
    next_id: i64,
    people: Vec<PersonRecord>,
    records: Vec<FaceEmbeddingRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStore for MemoryStore {
    type Error = Infallible;

    fn add_person(&mut self, name: &str, num_images: u64) -> Result<i64, Self::Error> {
        self.next_id += 1;
        self.people.push(PersonRecord {
            id: self.next_id,
            name: name.to_string(),
            num_images,
            added_at: Utc::now(),
        });
        Ok(self.next_id)
    }

    fn remove_person(&mut self, id: i64) -> Result<Removal, Self::Error> {
        let people = self.people.len();
        let records = self.records.len();
        self.people.retain(|p| p.id != id);
        self.records.retain(|r| r.person_id != id);
        Ok(Removal {
            person: self.people.len() != people,
            embeddings: records - self.records.len(),
        })
    }

    fn people(&self) -> Result<Vec<PersonRecord>, Self::Error> {
        Ok(self.people.clone())
    }

    fn count_people(&self) -> Result<u64, Self::Error> {
        Ok(self.people.len() as u64)
    }

    fn add_record(&mut self, record: &FaceEmbeddingRecord) -> Result<(), Self::Error> {
        self.records.push(record.clone());
        Ok(())
    }

    fn records(&self) -> Result<Vec<FaceEmbeddingRecord>, Self::Error> {
        Ok(self.records.clone())
    }
}
