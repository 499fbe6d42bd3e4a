//! Face embedding extraction.
//!
//! [`FaceNetExtractor`] runs the FaceNet-512 model via ONNX Runtime on a
//! cropped face and returns its 512-dimensional embedding.

use crate::types::{Embedding, EMBEDDING_DIM};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const FACENET_INPUT_SIZE: u32 = 160;
const FACENET_MODEL_VERSION: &str = "facenet_512";

#[derive(Error, Debug)]
pub enum ExtractorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Turns a cropped face into a fixed-length embedding.
pub trait EmbeddingExtractor {
    /// Length of every embedding this extractor produces.
    fn dim(&self) -> usize;

    fn extract(&mut self, face: &RgbImage) -> Result<Embedding, ExtractorError>;
}

/// FaceNet-512 embedding extractor.
pub struct FaceNetExtractor {
    session: Session,
}

impl FaceNetExtractor {
    /// Load the FaceNet ONNX model from the given path.
    pub fn load(model_path: &Path, intra_threads: usize) -> Result<Self, ExtractorError> {
        if !model_path.exists() {
            return Err(ExtractorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(intra_threads)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded FaceNet model"
        );

        Ok(Self { session })
    }

    /// Resize to 160x160 and standardize into an NHWC float tensor.
    ///
    /// Standardization is per image: every channel value has the image mean
    /// subtracted and is divided by the standard deviation, floored at
    /// `1 / sqrt(n)`.
    fn preprocess(face: &RgbImage) -> Result<Array4<f32>, ExtractorError> {
        let size = FACENET_INPUT_SIZE as usize;
        let resized = imageops::resize(
            face,
            FACENET_INPUT_SIZE,
            FACENET_INPUT_SIZE,
            FilterType::Triangle,
        );

        let pixels: Vec<f32> = resized.as_raw().iter().map(|&p| p as f32).collect();
        let n = pixels.len() as f32;
        let mean = pixels.iter().sum::<f32>() / n;
        let variance = pixels.iter().map(|p| (p - mean).powi(2)).sum::<f32>() / n;
        let std = variance.sqrt().max(1.0 / n.sqrt());

        let standardized: Vec<f32> = pixels.iter().map(|p| (p - mean) / std).collect();
        nhwc_tensor(standardized, size)
    }
}

impl EmbeddingExtractor for FaceNetExtractor {
    fn dim(&self) -> usize {
        EMBEDDING_DIM
    }

    fn extract(&mut self, face: &RgbImage) -> Result<Embedding, ExtractorError> {
        if face.width() == 0 || face.height() == 0 {
            return Err(ExtractorError::InferenceFailed("empty face crop".into()));
        }

        let input = Self::preprocess(face)?;
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ExtractorError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != EMBEDDING_DIM {
            return Err(ExtractorError::InferenceFailed(format!(
                "expected {EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Embedding {
            values: raw.to_vec(),
            model_version: Some(FACENET_MODEL_VERSION.to_string()),
        })
    }
}

/// Shape row-major RGB values of a `size`x`size` image as `[1, H, W, 3]`.
fn nhwc_tensor(values: Vec<f32>, size: usize) -> Result<Array4<f32>, ExtractorError> {
    Array4::from_shape_vec((1, size, size, 3), values)
        .map_err(|e| ExtractorError::InferenceFailed(format!("input tensor: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    const SIZE: usize = FACENET_INPUT_SIZE as usize;

    #[test]
    fn test_preprocess_output_shape() {
        let face = RgbImage::from_pixel(90, 120, Rgb([10, 20, 30]));
        let tensor = FaceNetExtractor::preprocess(&face).unwrap();
        assert_eq!(tensor.shape(), &[1, SIZE, SIZE, 3]);
    }

    #[test]
    fn test_preprocess_standardizes() {
        let face = RgbImage::from_fn(160, 160, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
        });
        let tensor = FaceNetExtractor::preprocess(&face).unwrap();

        let n = tensor.len() as f32;
        let mean = tensor.iter().sum::<f32>() / n;
        let var = tensor.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
        assert!(mean.abs() < 1e-3, "mean {mean}");
        assert!((var - 1.0).abs() < 1e-2, "variance {var}");
    }

    #[test]
    fn test_preprocess_uniform_image_is_zero() {
        // Zero variance: the std floor keeps this finite.
        let face = RgbImage::from_pixel(160, 160, Rgb([77, 77, 77]));
        let tensor = FaceNetExtractor::preprocess(&face).unwrap();
        assert!(tensor.iter().all(|v| v.abs() < 1e-6));
    }

    #[test]
    fn test_preprocess_keeps_channel_order() {
        let face = RgbImage::from_pixel(160, 160, Rgb([0, 128, 255]));
        let tensor = FaceNetExtractor::preprocess(&face).unwrap();
        assert!(tensor[[0, 0, 0, 0]] < tensor[[0, 0, 0, 1]]);
        assert!(tensor[[0, 0, 0, 1]] < tensor[[0, 0, 0, 2]]);
    }

    #[test]
    fn test_nhwc_tensor_rejects_wrong_length() {
        let err = nhwc_tensor(vec![0.0; 10], 2).unwrap_err();
        assert!(matches!(err, ExtractorError::InferenceFailed(_)));
        assert!(nhwc_tensor(vec![0.0; 12], 2).is_ok());
    }

    #[test]
    fn test_load_missing_model() {
        let err = FaceNetExtractor::load(Path::new("/nonexistent/facenet_512.onnx"), 1)
            .err()
            .unwrap();
        assert!(matches!(err, ExtractorError::ModelNotFound(_)));
    }
}
