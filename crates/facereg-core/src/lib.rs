//! facereg-core — face registration and recognition engine.
//!
//! Faces are found with SCRFD, embedded with FaceNet-512 (both via ONNX
//! Runtime) and identified by a linear cosine-similarity scan over the
//! stored embeddings.

pub mod detector;
pub mod extractor;
pub mod loader;
pub mod matcher;
pub mod pipeline;
pub mod store;
pub mod types;

pub use detector::{FaceDetector, ScrfdDetector};
pub use extractor::{EmbeddingExtractor, FaceNetExtractor};
pub use loader::LoadError;
pub use matcher::{EmbeddingMatcher, Match};
pub use pipeline::{FaceError, RecognitionService, Registration};
pub use store::{MemoryStore, RecordStore, Removal};
pub use types::{
    BoundingBox, Embedding, FaceEmbeddingRecord, MatchError, PersonRecord, Recognition,
    RecognitionMetrics, RecognitionResult, Rect, Verdict, EMBEDDING_DIM,
};

/// SCRFD detection model file name.
pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
/// FaceNet-512 embedding model file name.
pub const EMBEDDING_MODEL_FILE: &str = "facenet_512.onnx";
