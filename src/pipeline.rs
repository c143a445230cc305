//! Load → predict → write for one tile, and the tiled run over a whole raster.

use crate::chunking::{Extent, Tile, TileGrid};
use crate::cog::WriteOptions;
use crate::error::{ClassifyError, Result, TileError, TileErrorKind};
use crate::geo::GeoReference;
use crate::io::{write_label_raster, OpenSource, RasterSource, SourceInfo};
use crate::predict::{predict_block, Classifier, MissingValuePolicy, Prediction};
use crate::scheduler::{CancelToken, FailurePolicy, Scheduler};
use log::{debug, info, warn};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Result of one unit of work. Immutable once produced.
#[derive(Debug, Clone, PartialEq)]
pub struct TileOutput {
    pub index: usize,
    pub tile: Tile,
    pub result: std::result::Result<PathBuf, TileError>,
}

impl TileOutput {
    pub fn ok(index: usize, tile: Tile, path: PathBuf) -> Self {
        Self {
            index,
            tile,
            result: Ok(path),
        }
    }

    pub fn failed(index: usize, tile: Tile, error: TileError) -> Self {
        Self {
            index,
            tile,
            result: Err(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Persists predictions as `tile_<index>.tif` in one directory.
#[derive(Debug, Clone)]
pub struct TileWriter {
    dir: PathBuf,
    georef: GeoReference,
    options: WriteOptions,
}

impl TileWriter {
    /// `georef` is the georeference of the full source grid.
    pub fn new(dir: impl Into<PathBuf>, georef: GeoReference, options: WriteOptions) -> Self {
        Self {
            dir: dir.into(),
            georef,
            options,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn options(&self) -> &WriteOptions {
        &self.options
    }

    pub fn tile_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("tile_{}.tif", index))
    }

    /// Write one tile as a single strip, georeferenced to its window.
    pub fn write(&self, index: usize, prediction: &Prediction) -> Result<PathBuf> {
        let tile = prediction.tile;
        let path = self.tile_path(index);
        let options = WriteOptions {
            strip_rows: tile.rows,
            ..self.options.clone()
        };
        let labels = prediction
            .labels
            .as_slice()
            .ok_or_else(|| ClassifyError::InvalidArgument("label array is not contiguous".to_string()))?;

        write_label_raster(
            &path,
            Extent::new(tile.rows, tile.cols),
            &self.georef.for_window(&tile),
            &options,
            |_, strip| {
                strip.copy_from_slice(labels);
                Ok(())
            },
        )?;
        Ok(path)
    }
}

/// Worker-owned source handle, opened on first use and kept for the worker's lifetime.
pub struct SourceHandle<'a, O: OpenSource> {
    opener: &'a O,
    source: Option<O::Source>,
}

impl<'a, O: OpenSource> SourceHandle<'a, O> {
    pub fn new(opener: &'a O) -> Self {
        Self { opener, source: None }
    }

    pub fn get(&mut self) -> Result<&mut O::Source> {
        let source = match self.source.take() {
            Some(source) => source,
            None => {
                debug!("Opening source handles for worker");
                self.opener.open()?
            }
        };
        Ok(self.source.insert(source))
    }
}

/// The per-tile unit of work. Shares only read-only state.
pub struct WorkUnit<'a, M: Classifier + ?Sized> {
    model: &'a M,
    policy: &'a MissingValuePolicy,
    writer: &'a TileWriter,
}

impl<'a, M: Classifier + ?Sized> WorkUnit<'a, M> {
    pub fn new(model: &'a M, policy: &'a MissingValuePolicy, writer: &'a TileWriter) -> Self {
        Self { model, policy, writer }
    }

    pub fn process<O: OpenSource>(&self, handle: &mut SourceHandle<'_, O>, index: usize, tile: &Tile) -> TileOutput {
        let start = Instant::now();

        let block = match handle.get().and_then(|source| source.read_window(tile)) {
            Ok(block) => block,
            Err(e) => return TileOutput::failed(index, *tile, TileError::Load(e.to_string())),
        };

        let prediction = match predict_block(&block, self.model, self.policy, self.writer.options().nodata) {
            Ok(p) => p,
            Err(e) => return TileOutput::failed(index, *tile, TileError::Prediction(e.to_string())),
        };
        drop(block);

        match self.writer.write(index, &prediction) {
            Ok(path) => {
                debug!(
                    "Tile {} ({}) written to {} in {:.2?}",
                    index,
                    tile,
                    path.display(),
                    start.elapsed()
                );
                TileOutput::ok(index, *tile, path)
            }
            Err(e) => TileOutput::failed(index, *tile, TileError::Write(e.to_string())),
        }
    }
}

/// Settings of a tiled prediction run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub block_rows: usize,
    pub block_cols: usize,
    pub concurrency: usize,
    pub tile_dir: PathBuf,
    /// `tile_dir` is scratch space that is removed when the run ends.
    pub tile_dir_is_temporary: bool,
    pub failure_policy: FailurePolicy,
    pub write: WriteOptions,
    /// Replaces the nodata values declared by the input bands.
    pub nodata_override: Option<f64>,
    pub cancel: CancelToken,
}

impl PipelineConfig {
    pub fn new(tile_dir: impl Into<PathBuf>) -> Self {
        Self {
            block_rows: 2048,
            block_cols: 2048,
            concurrency: default_concurrency(),
            tile_dir: tile_dir.into(),
            tile_dir_is_temporary: false,
            failure_policy: FailurePolicy::default(),
            write: WriteOptions::default(),
            nodata_override: None,
            cancel: CancelToken::new(),
        }
    }

    pub fn missing_value_policy(&self, info: &SourceInfo) -> MissingValuePolicy {
        match self.nodata_override {
            Some(nd) => MissingValuePolicy::with_override(&info.sample_types, nd),
            None => MissingValuePolicy::new(info.nodata.clone()),
        }
    }
}

pub fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[derive(Debug, Clone, Serialize)]
pub struct WrittenTile {
    pub index: usize,
    pub tile: Tile,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedTile {
    pub index: usize,
    pub tile: Tile,
    pub kind: TileErrorKind,
    pub reason: String,
}

/// Outcome of a tiled run: every tile is either written or failed.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub extent: Extent,
    pub block_shape: (usize, usize),
    #[serde(skip)]
    pub georef: GeoReference,
    /// The written tile paths are deleted when the run ends.
    pub tiles_temporary: bool,
    pub written: Vec<WrittenTile>,
    pub failed: Vec<FailedTile>,
}

impl RunReport {
    pub fn from_outputs(extent: Extent, block_shape: (usize, usize), georef: GeoReference, outputs: Vec<TileOutput>) -> Self {
        let mut written = Vec::new();
        let mut failed = Vec::new();
        for output in outputs {
            match output.result {
                Ok(path) => written.push(WrittenTile {
                    index: output.index,
                    tile: output.tile,
                    path,
                }),
                Err(e) => failed.push(FailedTile {
                    index: output.index,
                    tile: output.tile,
                    kind: e.kind(),
                    reason: e.to_string(),
                }),
            }
        }
        Self {
            extent,
            block_shape,
            georef,
            tiles_temporary: false,
            written,
            failed,
        }
    }

    pub fn total_tiles(&self) -> usize {
        self.written.len() + self.failed.len()
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn written_paths(&self) -> Vec<PathBuf> {
        self.written.iter().map(|t| t.path.clone()).collect()
    }

    pub fn log_summary(&self) {
        info!(
            "Tiles: {} succeeded, {} failed (of {})",
            self.written.len(),
            self.failed.len(),
            self.total_tiles()
        );
        for f in &self.failed {
            warn!("  tile {} ({}): {}", f.index, f.tile, f.reason);
        }
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        let file = fs::File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }
}

/// Classify a whole band stack tile by tile.
///
/// Fails only for invalid arguments; per-tile failures are collected in the
/// returned report.
pub fn run_tiled_prediction<O, M>(opener: &O, info: &SourceInfo, model: &M, config: &PipelineConfig) -> Result<RunReport>
where
    O: OpenSource,
    M: Classifier + ?Sized,
{
    if model.band_count() != info.band_count {
        return Err(ClassifyError::InvalidArgument(format!(
            "model was fitted on {} bands but the input has {}",
            model.band_count(),
            info.band_count
        )));
    }

    let grid = TileGrid::new(info.extent, config.block_rows, config.block_cols)?;
    let scheduler = Scheduler::new(config.concurrency)?
        .with_failure_policy(config.failure_policy)
        .with_cancel_token(config.cancel.clone());

    fs::create_dir_all(&config.tile_dir)?;
    let writer = TileWriter::new(&config.tile_dir, info.georef.clone(), config.write.clone());
    let policy = config.missing_value_policy(info);
    let unit = WorkUnit::new(model, &policy, &writer);

    info!(
        "Classifying {} raster in {} tiles of {}x{} into {}",
        info.extent,
        grid.total_tiles,
        config.block_rows,
        config.block_cols,
        config.tile_dir.display()
    );

    let start = Instant::now();
    let tiles = grid.tiles();
    let outputs = scheduler.run(
        &tiles,
        || SourceHandle::new(opener),
        |handle, index, tile| unit.process(handle, index, tile),
    )?;
    info!("Tiled prediction finished in {:.2?}", start.elapsed());

    let mut report = RunReport::from_outputs(info.extent, grid.block_shape(), info.georef.clone(), outputs);
    report.tiles_temporary = config.tile_dir_is_temporary;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::GeoTransform;
    use crate::io::{read_band, write_f32_band, TiffStack};
    use crate::predict::tests::Threshold;
    use ndarray::Array2;
    use tempfile::tempdir;

    #[test]
    fn test_tile_writer_georeferences_window() {
        let dir = tempdir().unwrap();
        let georef = GeoReference::new(GeoTransform([0.0, 2.0, 0.0, 100.0, 0.0, -2.0]));
        let writer = TileWriter::new(dir.path(), georef, WriteOptions::default());
        let prediction = Prediction {
            tile: Tile::new(4, 6, 2, 3),
            labels: ndarray::arr2(&[[1, 2, 0], [2, 2, 1]]),
        };

        let path = writer.write(7, &prediction).unwrap();
        assert_eq!(path, dir.path().join("tile_7.tif"));

        let (data, tile_georef, nodata) = read_band(&path).unwrap();
        assert_eq!(nodata, Some(0.0));
        assert_eq!(tile_georef.transform.origin(), (12.0, 92.0));
        assert_eq!(data.mapv(|v| v as u8), prediction.labels);
    }

    #[test]
    fn test_write_error_is_captured() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("b1.tif");
        let data = Array2::from_shape_fn((8, 8), |(r, _)| r as f32);
        write_f32_band(&src, &data, &GeoReference::default(), None, 8).unwrap();

        let (stack, _) = TiffStack::open_proxy(&[&src]).unwrap();
        let model = Threshold { bands: 1, cut: 4.0 };
        let policy = MissingValuePolicy::new(vec![None]);
        let writer = TileWriter::new(dir.path().join("missing").join("dir"), GeoReference::default(), WriteOptions::default());
        let unit = WorkUnit::new(&model, &policy, &writer);

        let mut handle = SourceHandle::new(&stack);
        let out = unit.process(&mut handle, 0, &Tile::new(0, 0, 4, 4));
        assert_eq!(out.result.unwrap_err().kind(), TileErrorKind::Write);
    }

    #[test]
    fn test_report_flags_temporary_tiles() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("b1.tif");
        write_f32_band(&src, &Array2::from_elem((6, 6), 9.0), &GeoReference::default(), None, 6).unwrap();

        let (stack, info) = TiffStack::open_proxy(&[&src]).unwrap();
        let model = Threshold { bands: 1, cut: 5.0 };
        let mut config = PipelineConfig::new(dir.path().join("tiles"));
        config.block_rows = 3;
        config.block_cols = 3;
        config.concurrency = 1;
        config.tile_dir_is_temporary = true;

        let report = run_tiled_prediction(&stack, &info, &model, &config).unwrap();
        assert_eq!(report.written.len(), 4);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["tiles_temporary"], serde_json::json!(true));
        assert_eq!(json["written"].as_array().map(|w| w.len()), Some(4));

        config.tile_dir_is_temporary = false;
        let kept = run_tiled_prediction(&stack, &info, &model, &config).unwrap();
        assert_eq!(serde_json::to_value(&kept).unwrap()["tiles_temporary"], serde_json::json!(false));
    }

    #[test]
    fn test_band_mismatch_fails_before_work() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("b1.tif");
        write_f32_band(&src, &Array2::zeros((4, 4)), &GeoReference::default(), None, 4).unwrap();

        let (stack, info) = TiffStack::open_proxy(&[&src]).unwrap();
        let model = Threshold { bands: 3, cut: 0.0 };
        let config = PipelineConfig::new(dir.path().join("tiles"));
        assert!(matches!(
            run_tiled_prediction(&stack, &info, &model, &config),
            Err(ClassifyError::InvalidArgument(_))
        ));
        assert!(!dir.path().join("tiles").exists());
    }
}
