//! facereg-store — SQLite persistence for people and face embeddings.

use chrono::{DateTime, Utc};
use facereg_core::{Embedding, FaceEmbeddingRecord, PersonRecord, RecordStore, Removal};
use rusqlite::{params, Connection};
use std::path::Path;
use thiserror::Error;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS people (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL,
    num_images  INTEGER NOT NULL,
    added_at    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS face_embeddings (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    person_id      INTEGER NOT NULL,
    person_name    TEXT NOT NULL,
    embedding      BLOB NOT NULL,
    dim            INTEGER NOT NULL,
    model_version  TEXT
);

CREATE INDEX IF NOT EXISTS idx_face_embeddings_person
    ON face_embeddings(person_id);
"#;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("creating {path}: {source}")]
    CreateDir {
        path: String,
        source: std::io::Error,
    },
    #[error("corrupt embedding for record {id}: {len} bytes, expected {expected}")]
    CorruptEmbedding { id: i64, len: usize, expected: usize },
    #[error("bad timestamp for person {id}: {source}")]
    Timestamp {
        id: i64,
        source: chrono::ParseError,
    },
}

/// SQLite-backed [`RecordStore`].
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (or create) the database at `path`, creating parent directories
    /// and the schema as needed.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let conn = Connection::open(path)?;
        tracing::info!(path = %path.display(), "opened face store");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn count_records(&self) -> Result<u64, StoreError> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM face_embeddings", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

impl RecordStore for SqliteStore {
    type Error = StoreError;

    fn add_person(&mut self, name: &str, num_images: u64) -> Result<i64, StoreError> {
        self.conn.execute(
            "INSERT INTO people (name, num_images, added_at) VALUES (?1, ?2, ?3)",
            params![name, num_images as i64, Utc::now().to_rfc3339()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn remove_person(&mut self, id: i64) -> Result<Removal, StoreError> {
        let tx = self.conn.transaction()?;
        let embeddings = tx.execute(
            "DELETE FROM face_embeddings WHERE person_id = ?1",
            params![id],
        )?;
        let person = tx.execute("DELETE FROM people WHERE id = ?1", params![id])? > 0;
        tx.commit()?;
        Ok(Removal { person, embeddings })
    }

    fn people(&self) -> Result<Vec<PersonRecord>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, num_images, added_at FROM people ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut people = Vec::new();
        for row in rows {
            let (id, name, num_images, added_at) = row?;
            let added_at = DateTime::parse_from_rfc3339(&added_at)
                .map_err(|source| StoreError::Timestamp { id, source })?
                .with_timezone(&Utc);
            people.push(PersonRecord {
                id,
                name,
                num_images: num_images as u64,
                added_at,
            });
        }
        Ok(people)
    }

    fn count_people(&self) -> Result<u64, StoreError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM people", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn add_record(&mut self, record: &FaceEmbeddingRecord) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO face_embeddings (person_id, person_name, embedding, dim, model_version)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.person_id,
                record.person_name,
                embedding_to_bytes(&record.embedding.values),
                record.embedding.len() as i64,
                record.embedding.model_version,
            ],
        )?;
        Ok(())
    }

    fn records(&self) -> Result<Vec<FaceEmbeddingRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, person_id, person_name, embedding, dim, model_version
             FROM face_embeddings ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Vec<u8>>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, Option<String>>(5)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (id, person_id, person_name, bytes, dim, model_version) = row?;
            let expected = dim as usize * 4;
            if bytes.len() != expected {
                return Err(StoreError::CorruptEmbedding {
                    id,
                    len: bytes.len(),
                    expected,
                });
            }
            records.push(FaceEmbeddingRecord {
                person_id,
                person_name,
                embedding: Embedding {
                    values: bytes_to_embedding(&bytes),
                    model_version,
                },
            });
        }
        Ok(records)
    }
}

/// Little-endian f32 bytes.
fn embedding_to_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(person_id: i64, name: &str, values: &[f32]) -> FaceEmbeddingRecord {
        FaceEmbeddingRecord {
            person_id,
            person_name: name.into(),
            embedding: Embedding {
                values: values.to_vec(),
                model_version: Some("facenet_512".into()),
            },
        }
    }

    #[test]
    fn test_people_roundtrip() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let alice = store.add_person("alice", 3).unwrap();
        let bob = store.add_person("bob", 1).unwrap();
        assert_ne!(alice, bob);

        let people = store.people().unwrap();
        assert_eq!(people.len(), 2);
        assert_eq!(people[0].name, "alice");
        assert_eq!(people[0].num_images, 3);
        assert!(people[0].added_at <= Utc::now());
        assert_eq!(store.count_people().unwrap(), 2);
    }

    #[test]
    fn test_records_roundtrip_in_order() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store.add_record(&record(1, "alice", &[0.25, -1.5, 3.0])).unwrap();
        store.add_record(&record(2, "bob", &[f32::MIN_POSITIVE, 0.0, -0.0])).unwrap();

        let records = store.records().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], record(1, "alice", &[0.25, -1.5, 3.0]));
        assert_eq!(records[1].embedding.values[0], f32::MIN_POSITIVE);
        assert_eq!(store.count_records().unwrap(), 2);
    }

    #[test]
    fn test_remove_person_drops_their_records() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let alice = store.add_person("alice", 2).unwrap();
        let bob = store.add_person("bob", 1).unwrap();
        store.add_record(&record(alice, "alice", &[1.0, 0.0])).unwrap();
        store.add_record(&record(bob, "bob", &[0.0, 1.0])).unwrap();
        store.add_record(&record(alice, "alice", &[0.9, 0.1])).unwrap();

        let removal = store.remove_person(alice).unwrap();
        assert_eq!(
            removal,
            Removal {
                person: true,
                embeddings: 2
            }
        );
        assert!(store.remove_person(alice).unwrap().is_empty());

        let records = store.records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].person_id, bob);
        assert_eq!(store.count_people().unwrap(), 1);
    }

    #[test]
    fn test_failed_remove_person_keeps_records() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let alice = store.add_person("alice", 1).unwrap();
        store.add_record(&record(alice, "alice", &[1.0, 0.0])).unwrap();
        store
            .conn
            .execute_batch(
                "CREATE TRIGGER keep_people BEFORE DELETE ON people
                 BEGIN SELECT RAISE(ABORT, 'people are read-only'); END;",
            )
            .unwrap();

        assert!(store.remove_person(alice).is_err());
        assert_eq!(store.count_people().unwrap(), 1);
        assert_eq!(store.records().unwrap().len(), 1);
    }

    #[test]
    fn test_corrupt_embedding_is_reported() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store.add_record(&record(1, "alice", &[1.0, 2.0])).unwrap();
        store
            .conn
            .execute("UPDATE face_embeddings SET dim = 3", [])
            .unwrap();

        let err = store.records().unwrap_err();
        assert!(matches!(
            err,
            StoreError::CorruptEmbedding { len: 8, expected: 12, .. }
        ));
    }

    #[test]
    fn test_open_creates_parent_dirs() {
        let dir = std::env::temp_dir().join(format!("facereg-store-{}", std::process::id()));
        let path = dir.join("nested/faces.db");
        {
            let mut store = SqliteStore::open(&path).unwrap();
            store.add_person("alice", 1).unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.count_people().unwrap(), 1);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_gallery_loads_into_matcher() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store.add_record(&record(1, "alice", &[1.0, 0.0])).unwrap();
        store.add_record(&record(2, "bob", &[0.0, 1.0])).unwrap();

        let matcher =
            facereg_core::EmbeddingMatcher::with_records(2, store.records().unwrap()).unwrap();
        let best = matcher
            .nearest(&Embedding::new(vec![0.1, 0.9]))
            .unwrap()
            .unwrap();
        assert_eq!(best.record.person_name, "bob");
    }
}
