use crate::chunking::Tile;
use crate::error::{ClassifyError, Result};
use crate::io::{Block, SampleType};
use log::debug;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

/// Largest cluster count that still fits a u8 label next to the nodata value.
pub const MAX_CLASSES: usize = 254;

/// A fitted model that assigns one cluster per pixel.
///
/// Implementations are shared by every worker at once, so prediction takes
/// `&self` and must not mutate the model.
pub trait Classifier: Sync {
    fn band_count(&self) -> usize;

    fn class_count(&self) -> usize;

    /// Cluster index in `0..class_count()` for every row of `pixels`
    /// (one row per pixel, one column per band).
    fn classify(&self, pixels: ArrayView2<'_, f64>) -> Result<Array1<usize>>;
}

/// Which input values count as missing. The same policy drives sampling and
/// prediction, sequential or parallel.
#[derive(Debug, Clone, PartialEq)]
pub struct MissingValuePolicy {
    nodata: Vec<Option<f64>>,
}

impl MissingValuePolicy {
    /// Per-band nodata values; NaN is always treated as missing.
    pub fn new(nodata: Vec<Option<f64>>) -> Self {
        Self { nodata }
    }

    /// Use one nodata value for every band, replacing the declared ones. The
    /// value is rounded to each band's sample type.
    pub fn with_override(sample_types: &[SampleType], nodata: f64) -> Self {
        Self {
            nodata: sample_types.iter().map(|t| Some(t.quantize(nodata))).collect(),
        }
    }

    pub fn is_missing(&self, band: usize, value: f64) -> bool {
        if value.is_nan() {
            return true;
        }
        match self.nodata.get(band).copied().flatten() {
            Some(nd) if nd.is_nan() => false,
            Some(nd) => value == nd,
            None => false,
        }
    }

    pub fn pixel_is_missing(&self, values: ArrayView1<'_, f64>) -> bool {
        values.iter().enumerate().any(|(b, &v)| self.is_missing(b, v))
    }
}

/// One label per pixel of a block. Missing pixels hold the nodata value.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub tile: Tile,
    pub labels: Array2<u8>,
}

/// Classify every valid pixel of a block.
///
/// Labels are written as `cluster + 1`; pixels missing in any band get `nodata`.
pub fn predict_block<M: Classifier + ?Sized>(
    block: &Block,
    model: &M,
    policy: &MissingValuePolicy,
    nodata: u8,
) -> Result<Prediction> {
    let (bands, rows, cols) = block.data.dim();
    if bands != model.band_count() {
        return Err(ClassifyError::BandCountMismatch {
            expected: model.band_count(),
            found: bands,
        });
    }
    if model.class_count() > MAX_CLASSES {
        return Err(ClassifyError::InvalidArgument(format!(
            "{} classes do not fit in an 8-bit label raster (max {})",
            model.class_count(),
            MAX_CLASSES
        )));
    }

    // Gather valid pixels into a (pixels, bands) matrix
    let mut valid_idx = Vec::with_capacity(rows * cols);
    let mut values = Vec::with_capacity(rows * cols * bands);
    for r in 0..rows {
        for c in 0..cols {
            let px = block.data.slice(ndarray::s![.., r, c]);
            if policy.pixel_is_missing(px) {
                continue;
            }
            valid_idx.push(r * cols + c);
            values.extend(px.iter().copied());
        }
    }

    let mut labels = Array2::from_elem((rows, cols), nodata);
    debug!(
        "Predicting tile {}: {} of {} pixels valid",
        block.tile,
        valid_idx.len(),
        rows * cols
    );
    if valid_idx.is_empty() {
        return Ok(Prediction {
            tile: block.tile,
            labels,
        });
    }

    let pixels = Array2::from_shape_vec((valid_idx.len(), bands), values)?;
    let clusters = model.classify(pixels.view())?;
    if clusters.len() != valid_idx.len() {
        return Err(ClassifyError::InvalidArgument(format!(
            "model returned {} labels for {} pixels",
            clusters.len(),
            valid_idx.len()
        )));
    }

    let flat = labels
        .as_slice_mut()
        .ok_or_else(|| ClassifyError::InvalidArgument("label array is not contiguous".to_string()))?;
    for (&idx, &cluster) in valid_idx.iter().zip(clusters.iter()) {
        if cluster >= model.class_count() {
            return Err(ClassifyError::InvalidArgument(format!(
                "model returned cluster {} outside 0..{}",
                cluster,
                model.class_count()
            )));
        }
        flat[idx] = cluster as u8 + 1;
    }

    Ok(Prediction {
        tile: block.tile,
        labels,
    })
}
