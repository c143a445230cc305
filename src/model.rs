use crate::error::{ClassifyError, Result};
use crate::predict::{Classifier, MAX_CLASSES};
use linfa::prelude::*;
use linfa::DatasetBase;
use linfa_clustering::GaussianMixtureModel;
use log::info;
use ndarray::{Array1, Array2, ArrayView2};
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256Plus;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

#[derive(Debug, Clone, PartialEq)]
pub struct FitOptions {
    pub seed: u64,
    pub n_runs: u64,
    pub max_iterations: u64,
    pub tolerance: f64,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            seed: 42,
            n_runs: 3,
            max_iterations: 200,
            tolerance: 1e-4,
        }
    }
}

/// Gaussian mixture model over the band values of a pixel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GmmClassifier {
    bands: usize,
    clusters: usize,
    gmm: GaussianMixtureModel<f64>,
}

impl GmmClassifier {
    /// Fit on a (samples, bands) matrix that holds no missing values.
    pub fn fit(samples: &Array2<f64>, clusters: usize, options: &FitOptions) -> Result<Self> {
        let (n, bands) = samples.dim();
        if clusters == 0 || clusters > MAX_CLASSES {
            return Err(ClassifyError::InvalidArgument(format!(
                "cluster count must be in 1..={}, got {}",
                MAX_CLASSES, clusters
            )));
        }
        if n < clusters {
            return Err(ClassifyError::InvalidArgument(format!(
                "{} samples are not enough for {} clusters",
                n, clusters
            )));
        }

        info!(
            "Fitting Gaussian mixture: {} clusters, {} samples x {} bands (seed {})",
            clusters, n, bands, options.seed
        );

        let dataset = DatasetBase::new(samples.clone(), ());
        let rng = Xoshiro256Plus::seed_from_u64(options.seed);
        let gmm = GaussianMixtureModel::<f64>::params(clusters)
            .n_runs(options.n_runs)
            .max_n_iterations(options.max_iterations)
            .tolerance(options.tolerance)
            .with_rng(rng)
            .fit(&dataset)?;

        info!("Model fitted");
        Ok(Self { bands, clusters, gmm })
    }

    pub fn means(&self) -> &Array2<f64> {
        self.gmm.means()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(writer, self)?;
        info!("Saved model to {}", path.display());
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let model: GmmClassifier = serde_json::from_reader(reader)?;
        info!(
            "Loaded model from {} ({} clusters, {} bands)",
            path.display(),
            model.clusters,
            model.bands
        );
        Ok(model)
    }
}

impl Classifier for GmmClassifier {
    fn band_count(&self) -> usize {
        self.bands
    }

    fn class_count(&self) -> usize {
        self.clusters
    }

    fn classify(&self, pixels: ArrayView2<'_, f64>) -> Result<Array1<usize>> {
        if pixels.ncols() != self.bands {
            return Err(ClassifyError::BandCountMismatch {
                expected: self.bands,
                found: pixels.ncols(),
            });
        }
        Ok(self.gmm.predict(&pixels))
    }
}
