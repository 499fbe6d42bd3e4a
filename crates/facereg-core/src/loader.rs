//! Photo decoding with EXIF orientation applied.

use image::{DynamicImage, ImageDecoder, ImageError, ImageReader, RgbImage};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("decoding {path}: {source}")]
    Decode { path: PathBuf, source: ImageError },
}

/// Decode an image file and rotate it upright according to its EXIF
/// orientation tag, if any.
pub fn load_rgb(path: &Path) -> Result<RgbImage, LoadError> {
    let io_err = |source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    };
    let decode_err = |source| LoadError::Decode {
        path: path.to_path_buf(),
        source,
    };

    let reader = ImageReader::open(path)
        .map_err(io_err)?
        .with_guessed_format()
        .map_err(io_err)?;
    let mut decoder = reader.into_decoder().map_err(decode_err)?;
    let orientation = decoder.orientation().map_err(decode_err)?;
    let mut image = DynamicImage::from_decoder(decoder).map_err(decode_err)?;
    image.apply_orientation(orientation);

    tracing::debug!(
        path = %path.display(),
        width = image.width(),
        height = image.height(),
        ?orientation,
        "image loaded"
    );

    Ok(image.to_rgb8())
}
