use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Output dimensionality of the FaceNet-512 embedding model.
pub const EMBEDDING_DIM: usize = 512;

/// Display name used for a face that matched nobody.
pub const NOT_RECOGNIZED: &str = "Not recognized";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("embedding length mismatch: expected {expected}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
}

/// Face bounding box in image coordinates, as produced by a detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl BoundingBox {
    /// Round to whole pixels.
    pub fn to_rect(&self) -> Rect {
        let left = self.x.round() as i64;
        let top = self.y.round() as i64;
        let right = (self.x + self.width).round() as i64;
        let bottom = (self.y + self.height).round() as i64;
        Rect {
            left,
            top,
            width: right - left,
            height: bottom - top,
        }
    }

    /// Intersection-over-union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.width * self.height + other.width * other.height - inter;

        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }
}

/// Integer pixel rectangle. Signed so that boxes hanging off the image edge
/// can be represented and rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub left: i64,
    pub top: i64,
    pub width: i64,
    pub height: i64,
}

impl Rect {
    /// True when the rectangle is non-empty and lies fully inside a
    /// `width` x `height` image.
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.left >= 0
            && self.top >= 0
            && self.width > 0
            && self.height > 0
            && self.left + self.width <= i64::from(width)
            && self.top + self.height <= i64::from(height)
    }
}

/// Face embedding vector (512-dimensional for FaceNet-512).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model that produced this embedding (e.g., "facenet_512").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    ///
    /// A zero-magnitude vector scores 0.0 against anything.
    pub fn similarity(&self, other: &Embedding) -> Result<f32, MatchError> {
        cosine_similarity(&self.values, &other.values)
    }
}

/// Dot product divided by the product of magnitudes.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32, MatchError> {
    if a.len() != b.len() {
        return Err(MatchError::LengthMismatch {
            expected: a.len(),
            actual: b.len(),
        });
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    Ok(if denom > 0.0 { dot / denom } else { 0.0 })
}

/// One stored face embedding belonging to a person.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceEmbeddingRecord {
    pub person_id: i64,
    pub person_name: String,
    pub embedding: Embedding,
}

/// A registered person.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonRecord {
    pub id: i64,
    pub name: String,
    /// Number of photos submitted when the person was registered.
    pub num_images: u64,
    pub added_at: DateTime<Utc>,
}

/// Outcome of classifying one query embedding against the gallery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Verdict {
    Recognized {
        person_id: i64,
        person_name: String,
        score: f32,
    },
    /// Best score seen, if the gallery was not empty.
    Unknown { best_score: Option<f32> },
}

impl Verdict {
    pub fn is_recognized(&self) -> bool {
        matches!(self, Verdict::Recognized { .. })
    }

    pub fn display_name(&self) -> &str {
        match self {
            Verdict::Recognized { person_name, .. } => person_name,
            Verdict::Unknown { .. } => NOT_RECOGNIZED,
        }
    }
}

/// Per-face result of a recognition pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionResult {
    pub verdict: Verdict,
    pub bounding_box: Rect,
}

impl RecognitionResult {
    pub fn person_name(&self) -> &str {
        self.verdict.display_name()
    }
}

/// Timings for one recognition pass, in milliseconds. Embedding and search
/// times are averaged over the faces in the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecognitionMetrics {
    pub detection_ms: u64,
    pub embedding_ms: u64,
    pub search_ms: u64,
}

impl RecognitionMetrics {
    /// Build metrics from accumulated durations over `faces` faces.
    /// Returns `None` when no face was processed.
    pub fn from_totals(
        detection: Duration,
        embedding_total: Duration,
        search_total: Duration,
        faces: usize,
    ) -> Option<Self> {
        if faces == 0 {
            return None;
        }
        let faces = faces as u64;
        Some(Self {
            detection_ms: detection.as_millis() as u64,
            embedding_ms: embedding_total.as_millis() as u64 / faces,
            search_ms: search_total.as_millis() as u64 / faces,
        })
    }
}

/// Everything recognized in one frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Recognition {
    pub metrics: Option<RecognitionMetrics>,
    pub faces: Vec<RecognitionResult>,
}
