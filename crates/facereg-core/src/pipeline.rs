//! Registration and recognition built on injected collaborators.
//!
//! A [`RecognitionService`] owns a face detector, an embedding extractor and a
//! record store, and keeps an [`EmbeddingMatcher`] in sync with the store.
//! Every request runs detection, extraction and the matching scan
//! sequentially on the calling thread.

use crate::detector::{DetectorError, FaceDetector};
use crate::extractor::{EmbeddingExtractor, ExtractorError};
use crate::loader::LoadError;
use crate::matcher::EmbeddingMatcher;
use crate::store::{RecordStore, Removal};
use crate::types::{
    BoundingBox, FaceEmbeddingRecord, MatchError, Recognition, RecognitionMetrics,
    RecognitionResult, Rect,
};
use image::imageops;
use image::RgbImage;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FaceError {
    #[error("face detection failed: {0}")]
    DetectionFailed(String),
    #[error("no face found in image")]
    NoFace,
    #[error("expected one face, found {0}")]
    MultipleFaces(usize),
    #[error("unreadable image: {0}")]
    Image(#[from] LoadError),
    #[error("embedding length mismatch: expected {expected}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("extractor: {0}")]
    Extractor(#[from] ExtractorError),
    #[error("store: {0}")]
    Store(Box<dyn std::error::Error + Send + Sync>),
}

impl From<MatchError> for FaceError {
    fn from(err: MatchError) -> Self {
        match err {
            MatchError::LengthMismatch { expected, actual } => {
                FaceError::LengthMismatch { expected, actual }
            }
        }
    }
}

fn store_err<E: std::error::Error + Send + Sync + 'static>(err: E) -> FaceError {
    FaceError::Store(Box::new(err))
}

/// Outcome of registering a person from several photos.
#[derive(Debug)]
pub struct Registration {
    pub person_id: i64,
    /// One entry per submitted image, in order.
    pub outcomes: Vec<Result<(), FaceError>>,
}

impl Registration {
    pub fn added(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_ok()).count()
    }
}

pub struct RecognitionService<D, E, S> {
    detector: D,
    extractor: E,
    store: S,
    matcher: Arc<EmbeddingMatcher>,
    threshold: f32,
}

impl<D, E, S> RecognitionService<D, E, S>
where
    D: FaceDetector,
    E: EmbeddingExtractor,
    S: RecordStore,
{
    /// Build the service and load every stored embedding into the matcher.
    pub fn new(detector: D, extractor: E, store: S, threshold: f32) -> Result<Self, FaceError> {
        let records = store.records().map_err(store_err)?;
        let count = records.len();
        let matcher = EmbeddingMatcher::with_records(extractor.dim(), records)?;
        tracing::info!(records = count, dim = matcher.dim(), threshold, "gallery loaded");

        Ok(Self {
            detector,
            extractor,
            store,
            matcher: Arc::new(matcher),
            threshold,
        })
    }

    pub fn matcher(&self) -> Arc<EmbeddingMatcher> {
        Arc::clone(&self.matcher)
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Create a person and add one embedding per usable image.
    ///
    /// Every submitted photo counts towards `num_images`, including ones
    /// that could not be decoded. Failing images are reported but do not
    /// stop the rest.
    pub fn register_person(
        &mut self,
        name: &str,
        images: Vec<Result<RgbImage, LoadError>>,
    ) -> Result<Registration, FaceError> {
        let submitted = images.len();
        let person_id = self
            .store
            .add_person(name, submitted as u64)
            .map_err(store_err)?;

        let mut outcomes = Vec::with_capacity(submitted);
        for (i, image) in images.into_iter().enumerate() {
            let outcome = image
                .map_err(FaceError::from)
                .and_then(|image| self.add_image(person_id, name, &image));
            if let Err(err) = &outcome {
                tracing::warn!(person_id, image = i, error = %err, "image not added");
            }
            outcomes.push(outcome);
        }

        let registration = Registration { person_id, outcomes };
        tracing::info!(
            person_id,
            name,
            added = registration.added(),
            submitted,
            "person registered"
        );
        Ok(registration)
    }

    /// Extract the single face in `image` and store its embedding.
    pub fn add_image(
        &mut self,
        person_id: i64,
        person_name: &str,
        image: &RgbImage,
    ) -> Result<(), FaceError> {
        let faces = self.detector.detect(image)?;
        let face = match faces.as_slice() {
            [] => return Err(FaceError::NoFace),
            [face] => face,
            many => return Err(FaceError::MultipleFaces(many.len())),
        };

        let rect = face.to_rect();
        let crop = crop(image, rect).ok_or_else(|| {
            FaceError::DetectionFailed(format!("face box {rect:?} outside image"))
        })?;

        let embedding = self.extractor.extract(&crop)?;
        let record = FaceEmbeddingRecord {
            person_id,
            person_name: person_name.to_string(),
            embedding,
        };
        // Validate before persisting so the store never holds a record the
        // matcher would reject.
        if record.embedding.len() != self.matcher.dim() {
            return Err(FaceError::LengthMismatch {
                expected: self.matcher.dim(),
                actual: record.embedding.len(),
            });
        }

        self.store.add_record(&record).map_err(store_err)?;
        self.matcher
            .add_record(record.person_id, record.person_name, record.embedding)?;
        Ok(())
    }

    /// Identify every face in a frame.
    pub fn recognize(&mut self, frame: &RgbImage) -> Result<Recognition, FaceError> {
        let started = Instant::now();
        let faces: Vec<(Rect, RgbImage)> = self
            .detector
            .detect(frame)?
            .iter()
            .map(BoundingBox::to_rect)
            .filter_map(|rect| crop(frame, rect).map(|c| (rect, c)))
            .collect();
        let detection = started.elapsed();

        let mut embedding_total = Duration::ZERO;
        let mut search_total = Duration::ZERO;
        let mut results = Vec::with_capacity(faces.len());

        for (rect, face) in &faces {
            let started = Instant::now();
            let embedding = self.extractor.extract(face)?;
            embedding_total += started.elapsed();

            let started = Instant::now();
            let verdict = self.matcher.classify(&embedding, self.threshold)?;
            search_total += started.elapsed();

            tracing::debug!(?rect, ?verdict, "face classified");
            results.push(RecognitionResult {
                verdict,
                bounding_box: *rect,
            });
        }

        Ok(Recognition {
            metrics: RecognitionMetrics::from_totals(
                detection,
                embedding_total,
                search_total,
                faces.len(),
            ),
            faces: results,
        })
    }

    /// Remove a person and all of their embeddings from the store, then
    /// from the matcher.
    pub fn remove_person(&mut self, person_id: i64) -> Result<Removal, FaceError> {
        let removal = self.store.remove_person(person_id).map_err(store_err)?;
        let dropped = self.matcher.remove_records(person_id);
        tracing::info!(
            person_id,
            existed = removal.person,
            embeddings = removal.embeddings,
            gallery = dropped,
            "person removed"
        );
        Ok(removal)
    }
}

/// Cut `rect` out of `image`, or `None` if it does not fit inside it.
fn crop(image: &RgbImage, rect: Rect) -> Option<RgbImage> {
    if !rect.fits_within(image.width(), image.height()) {
        return None;
    }
    Some(
        imageops::crop_imm(
            image,
            rect.left as u32,
            rect.top as u32,
            rect.width as u32,
            rect.height as u32,
        )
        .to_image(),
    )
}
