// End-to-end tests of the tiled classification pipeline on small rasters.

use geotiff_tiled_classify::chunking::{Extent, Tile, TileGrid};
use geotiff_tiled_classify::error::{ClassifyError, Result, TileErrorKind};
use geotiff_tiled_classify::geo::{GeoReference, GeoTransform};
use geotiff_tiled_classify::io::{read_band, write_f32_band, Block, OpenSource, RasterSource, SourceInfo, TiffStack};
use geotiff_tiled_classify::model::{FitOptions, GmmClassifier};
use geotiff_tiled_classify::mosaic::{assemble, Coverage};
use geotiff_tiled_classify::pipeline::{run_tiled_prediction, PipelineConfig};
use geotiff_tiled_classify::predict::{predict_block, Classifier, MissingValuePolicy};
use geotiff_tiled_classify::sample::{extract_values, sample_within_extent};
use geotiff_tiled_classify::scheduler::FailurePolicy;
use ndarray::{Array1, Array2, ArrayView2};
use std::path::{Path, PathBuf};
use tempfile::tempdir;

const ROWS: usize = 37;
const COLS: usize = 53;
const NODATA: f64 = -9999.0;

/// Two classes split on the mean of the bands.
struct Threshold {
    bands: usize,
    cut: f64,
}

impl Classifier for Threshold {
    fn band_count(&self) -> usize {
        self.bands
    }

    fn class_count(&self) -> usize {
        2
    }

    fn classify(&self, pixels: ArrayView2<'_, f64>) -> Result<Array1<usize>> {
        Ok(pixels
            .rows()
            .into_iter()
            .map(|row| usize::from(row.mean().unwrap_or(0.0) >= self.cut))
            .collect())
    }
}

fn georef() -> GeoReference {
    GeoReference::new(GeoTransform([500_000.0, 30.0, 0.0, 4_200_000.0, 0.0, -30.0]))
}

/// Two bands with a diagonal gradient and a handful of nodata pixels.
fn write_stack(dir: &Path) -> Vec<PathBuf> {
    let b1 = Array2::from_shape_fn((ROWS, COLS), |(r, c)| {
        if (r * COLS + c) % 41 == 0 {
            NODATA as f32
        } else {
            (r + c) as f32
        }
    });
    let b2 = Array2::from_shape_fn((ROWS, COLS), |(r, c)| (r as f32) * 0.5 + (c % 7) as f32);

    let p1 = dir.join("b1.tif");
    let p2 = dir.join("b2.tif");
    write_f32_band(&p1, &b1, &georef(), Some(NODATA), 5).unwrap();
    write_f32_band(&p2, &b2, &georef(), Some(NODATA), 16).unwrap();
    vec![p1, p2]
}

fn config(tile_dir: PathBuf, block: usize, concurrency: usize) -> PipelineConfig {
    PipelineConfig {
        block_rows: block,
        block_cols: block,
        concurrency,
        ..PipelineConfig::new(tile_dir)
    }
}

/// Labels of the whole raster predicted in a single block.
fn direct_prediction(stack: &TiffStack, info: &SourceInfo, model: &dyn Classifier) -> Array2<u8> {
    let mut source = stack.open().unwrap();
    let block = source.read_window(&Tile::new(0, 0, ROWS, COLS)).unwrap();
    let policy = MissingValuePolicy::new(info.nodata.clone());
    predict_block(&block, model, &policy, 0).unwrap().labels
}

fn as_labels(data: &Array2<f64>) -> Array2<u8> {
    data.mapv(|v| v as u8)
}

#[test]
fn test_mosaic_matches_direct_prediction() {
    let dir = tempdir().unwrap();
    let paths = write_stack(dir.path());
    let (stack, info) = TiffStack::open_proxy(&paths).unwrap();
    let model = Threshold { bands: 2, cut: 30.0 };

    let report = run_tiled_prediction(&stack, &info, &model, &config(dir.path().join("tiles"), 16, 4)).unwrap();
    assert!(report.is_complete());
    assert_eq!(report.total_tiles(), 3 * 4);

    let out = dir.path().join("classes.tif");
    let summary = assemble(&report, &out, &Default::default()).unwrap();
    assert_eq!(summary.coverage, Coverage::Full);
    assert_eq!(summary.extent, Extent::new(ROWS, COLS));

    let (mosaic, mosaic_georef, nodata) = read_band(&out).unwrap();
    assert_eq!(mosaic_georef.transform, info.georef.transform);
    assert_eq!(nodata, Some(0.0));
    assert_eq!(as_labels(&mosaic), direct_prediction(&stack, &info, &model));

    // Masked pixels carry the output nodata
    assert_eq!(mosaic[[0, 0]], 0.0);
}

#[test]
fn test_parallel_matches_sequential() {
    let dir = tempdir().unwrap();
    let paths = write_stack(dir.path());
    let (stack, info) = TiffStack::open_proxy(&paths).unwrap();
    let model = Threshold { bands: 2, cut: 25.0 };

    let seq = run_tiled_prediction(&stack, &info, &model, &config(dir.path().join("seq"), 10, 1)).unwrap();
    let par = run_tiled_prediction(&stack, &info, &model, &config(dir.path().join("par"), 10, 8)).unwrap();
    assert_eq!(seq.written.len(), par.written.len());

    for (a, b) in seq.written.iter().zip(&par.written) {
        assert_eq!(a.index, b.index);
        assert_eq!(a.tile, b.tile);
        let (la, ga, _) = read_band(&a.path).unwrap();
        let (lb, gb, _) = read_band(&b.path).unwrap();
        assert_eq!(la, lb, "tile {} differs", a.index);
        assert_eq!(ga, gb);
    }

    let seq_out = dir.path().join("seq.tif");
    let par_out = dir.path().join("par.tif");
    assemble(&seq, &seq_out, &Default::default()).unwrap();
    assemble(&par, &par_out, &Default::default()).unwrap();
    assert_eq!(read_band(&seq_out).unwrap().0, read_band(&par_out).unwrap().0);
}

/// Wraps a stack and fails to load one tile.
struct FailOnTile {
    inner: TiffStack,
    bad: Tile,
}

struct FailOnTileReader {
    inner: <TiffStack as OpenSource>::Source,
    bad: Tile,
}

impl OpenSource for FailOnTile {
    type Source = FailOnTileReader;

    fn open(&self) -> Result<FailOnTileReader> {
        Ok(FailOnTileReader {
            inner: self.inner.open()?,
            bad: self.bad,
        })
    }
}

impl RasterSource for FailOnTileReader {
    fn info(&self) -> &SourceInfo {
        self.inner.info()
    }

    fn read_window(&mut self, tile: &Tile) -> Result<Block> {
        if *tile == self.bad {
            return Err(ClassifyError::InvalidArgument("simulated read failure".to_string()));
        }
        self.inner.read_window(tile)
    }
}

#[test]
fn test_failed_tile_is_isolated_and_left_as_nodata() {
    let dir = tempdir().unwrap();
    let paths = write_stack(dir.path());
    let (stack, info) = TiffStack::open_proxy(&paths).unwrap();
    let model = Threshold { bands: 2, cut: 30.0 };

    // 37x53 in 20x12 blocks: 2 rows of 5 tiles
    let grid = TileGrid::new(info.extent, 20, 12).unwrap();
    assert_eq!(grid.total_tiles, 10);
    let bad = grid.tile(4);
    let opener = FailOnTile { inner: stack.clone(), bad };

    let mut cfg = config(dir.path().join("tiles"), 0, 3);
    cfg.block_rows = 20;
    cfg.block_cols = 12;
    let report = run_tiled_prediction(&opener, &info, &model, &cfg).unwrap();

    assert_eq!(report.written.len(), 9);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].index, 4);
    assert_eq!(report.failed[0].kind, TileErrorKind::Load);
    assert!(!dir.path().join("tiles").join("tile_4.tif").exists());

    let out = dir.path().join("partial.tif");
    let summary = assemble(&report, &out, &Default::default()).unwrap();
    assert_eq!(summary.coverage, Coverage::Partial { missing: vec![4] });
    assert_eq!(summary.tiles_used, 9);

    let (mosaic, _, _) = read_band(&out).unwrap();
    let direct = direct_prediction(&stack, &info, &model);
    for ((r, c), &v) in mosaic.indexed_iter() {
        if bad.contains(r, c) {
            assert_eq!(v, 0.0, "gap pixel ({}, {}) should be nodata", r, c);
        } else {
            assert_eq!(v as u8, direct[[r, c]]);
        }
    }
}

#[test]
fn test_fail_fast_stops_after_first_failure() {
    let dir = tempdir().unwrap();
    let paths = write_stack(dir.path());
    let (stack, info) = TiffStack::open_proxy(&paths).unwrap();
    let model = Threshold { bands: 2, cut: 30.0 };

    let grid = TileGrid::new(info.extent, 8, 8).unwrap();
    let opener = FailOnTile {
        inner: stack,
        bad: grid.tile(0),
    };
    let mut cfg = config(dir.path().join("tiles"), 8, 1);
    cfg.failure_policy = FailurePolicy::FailFast;

    let report = run_tiled_prediction(&opener, &info, &model, &cfg).unwrap();
    assert_eq!(report.total_tiles(), grid.total_tiles);
    assert!(report.written.is_empty());
    assert_eq!(report.failed[0].kind, TileErrorKind::Load);
    assert!(report.failed[1..].iter().all(|f| f.kind == TileErrorKind::Cancelled));
    assert!(cfg.cancel.is_cancelled());
}

#[test]
fn test_nodata_override_applies_to_every_band() {
    let dir = tempdir().unwrap();
    let paths = write_stack(dir.path());
    let (stack, info) = TiffStack::open_proxy(&paths).unwrap();
    let model = Threshold { bands: 2, cut: 30.0 };

    // Band 2 holds 0.0 at (0, 0) and (0, 7)
    let mut cfg = config(dir.path().join("tiles"), 16, 2);
    cfg.nodata_override = Some(0.0);
    let report = run_tiled_prediction(&stack, &info, &model, &cfg).unwrap();

    let out = dir.path().join("override.tif");
    assemble(&report, &out, &Default::default()).unwrap();
    let (mosaic, _, _) = read_band(&out).unwrap();
    assert_eq!(mosaic[[0, 7]], 0.0);
    // -9999 is no longer treated as missing, so the pixel gets a class
    assert_eq!(mosaic[[0, 41]], 1.0);
}

#[test]
fn test_gmm_end_to_end() {
    let dir = tempdir().unwrap();
    let paths = write_stack(dir.path());
    let (stack, info) = TiffStack::open_proxy(&paths).unwrap();
    let cfg = config(dir.path().join("tiles"), 16, 3);

    let policy = cfg.missing_value_policy(&info);
    let mut source = stack.open().unwrap();
    let points = sample_within_extent(info.extent, 500, 7);
    let samples = extract_values(&mut source, &points, &policy, 16, 16).unwrap();
    assert!(samples.nrows() > 400);
    assert!(samples.iter().all(|v| *v != NODATA));

    let options = FitOptions {
        seed: 7,
        ..FitOptions::default()
    };
    let model = GmmClassifier::fit(&samples, 3, &options).unwrap();
    let report = run_tiled_prediction(&stack, &info, &model, &cfg).unwrap();
    assert!(report.is_complete());

    let out = dir.path().join("gmm.tif");
    assemble(&report, &out, &Default::default()).unwrap();
    let (mosaic, _, _) = read_band(&out).unwrap();
    assert_eq!(as_labels(&mosaic), direct_prediction(&stack, &info, &model));
    assert!(mosaic.iter().all(|&v| (0.0..=3.0).contains(&v)));
}
