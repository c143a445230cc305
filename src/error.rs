use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClassifyError {
    #[cfg(feature = "gdal")]
    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),

    #[error("TIFF error: {0}")]
    Tiff(#[from] tiff::TiffError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Array shape error: {0}")]
    ShapeError(#[from] ndarray::ShapeError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Model fitting failed: {0}")]
    Model(#[from] linfa_clustering::GmmError),

    #[error("Worker pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Input raster has invalid dimensions: {0}x{1}")]
    InvalidDimensions(usize, usize),

    #[error("Band files disagree: {path} is {found}, expected {expected}")]
    BandMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },

    #[error("Unsupported pixel layout in {0}: {1}")]
    UnsupportedPixelFormat(PathBuf, String),

    #[error("Window {0} lies outside the {1}x{2} raster")]
    WindowOutOfRange(String, usize, usize),

    #[error("Model expects {expected} bands, block has {found}")]
    BandCountMismatch { expected: usize, found: usize },

    #[error("No usable samples: all {0} sampled pixels had missing values")]
    NoValidSamples(usize),

    #[error("Mosaic error: {0}")]
    Mosaic(String),

    #[error("Invalid compression type: {0}")]
    InvalidCompression(String),

    #[error("COG creation failed: {0}")]
    CogCreationFailed(String),

    #[error("Run cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, ClassifyError>;

/// Failure of a single tile. Captured in that tile's output, never propagated.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TileError {
    #[error("load failed: {0}")]
    Load(String),

    #[error("prediction failed: {0}")]
    Prediction(String),

    #[error("write failed: {0}")]
    Write(String),

    #[error("cancelled before processing")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TileErrorKind {
    Load,
    Prediction,
    Write,
    Cancelled,
}

impl TileError {
    pub fn kind(&self) -> TileErrorKind {
        match self {
            TileError::Load(_) => TileErrorKind::Load,
            TileError::Prediction(_) => TileErrorKind::Prediction,
            TileError::Write(_) => TileErrorKind::Write,
            TileError::Cancelled => TileErrorKind::Cancelled,
        }
    }
}
