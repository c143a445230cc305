//! Assemble tile files into one raster.
//!
//! A [`VirtualMosaic`] only knows where each tile sits on the output grid
//! (read from the tile headers); pixels are read when it is materialized,
//! one output strip at a time.

use crate::chunking::{Extent, Tile};
use crate::cog::WriteOptions;
use crate::error::{ClassifyError, Result};
use crate::geo::GeoReference;
use crate::io::{write_label_raster, TiffBand};
use crate::pipeline::RunReport;
use log::{debug, info, warn};
use ndarray::Array2;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq)]
pub struct MosaicEntry {
    pub path: PathBuf,
    /// Placement on the mosaic grid.
    pub window: Tile,
}

#[derive(Debug, Clone)]
pub struct VirtualMosaic {
    extent: Extent,
    georef: GeoReference,
    entries: Vec<MosaicEntry>,
}

impl VirtualMosaic {
    /// Place every tile on a grid.
    ///
    /// With `grid`, tiles are positioned on that extent and georeference and
    /// must fall inside it. Without, the mosaic covers the union of the tiles.
    /// Where tiles overlap, the later path wins.
    pub fn build<P: AsRef<Path>>(paths: &[P], grid: Option<(Extent, &GeoReference)>) -> Result<Self> {
        if paths.is_empty() {
            return Err(ClassifyError::Mosaic("no tiles to assemble".to_string()));
        }

        let mut placed = Vec::with_capacity(paths.len());
        for path in paths {
            let path = path.as_ref();
            let band = TiffBand::open(path)
                .map_err(|e| ClassifyError::Mosaic(format!("cannot open tile {}: {}", path.display(), e)))?;
            placed.push((path.to_path_buf(), band.extent, band.georef.clone()));
        }

        let (extent, georef) = match grid {
            Some((extent, georef)) => (extent, georef.clone()),
            None => union_grid(&placed)?,
        };

        let mut entries = Vec::with_capacity(placed.len());
        for (path, tile_extent, tile_georef) in placed {
            let (row, col) = georef
                .transform
                .pixel_offset_of(&tile_georef.transform)
                .map_err(|e| ClassifyError::Mosaic(format!("{}: {}", path.display(), e)))?;
            if row < 0 || col < 0 {
                return Err(ClassifyError::Mosaic(format!(
                    "{} starts outside the mosaic at ({}, {})",
                    path.display(),
                    row,
                    col
                )));
            }
            let window = Tile::new(row as usize, col as usize, tile_extent.rows, tile_extent.cols);
            if !window.fits_within(extent) {
                return Err(ClassifyError::Mosaic(format!(
                    "{} ({}) does not fit the {} mosaic",
                    path.display(),
                    window,
                    extent
                )));
            }
            debug!("Mosaic entry {} at {}", path.display(), window);
            entries.push(MosaicEntry { path, window });
        }

        Ok(Self {
            extent,
            georef,
            entries,
        })
    }

    pub fn extent(&self) -> Extent {
        self.extent
    }

    pub fn georef(&self) -> &GeoReference {
        &self.georef
    }

    pub fn entries(&self) -> &[MosaicEntry] {
        &self.entries
    }

    /// Write the mosaic as one raster. Pixels covered by no tile hold `options.nodata`.
    pub fn materialize(&self, destination: &Path, options: &WriteOptions) -> Result<()> {
        info!(
            "Materializing {} mosaic from {} tiles: {}",
            self.extent,
            self.entries.len(),
            destination.display()
        );

        let mut cache = StripCache::new(&self.entries, options.nodata);
        write_label_raster(destination, self.extent, &self.georef, options, |row_off, strip| {
            cache.fill(row_off, strip, self.extent.cols)
        })?;
        debug!("Decoded {} tile files", cache.loads);
        Ok(())
    }
}

/// Decoded labels of the tiles that intersect the strip being written.
///
/// A tile is decoded once, when the first strip reaches it, and dropped once
/// the strips have moved past its last row.
struct StripCache<'a> {
    entries: &'a [MosaicEntry],
    nodata: u8,
    decoded: HashMap<usize, Array2<u8>>,
    loads: usize,
}

impl<'a> StripCache<'a> {
    fn new(entries: &'a [MosaicEntry], nodata: u8) -> Self {
        Self {
            entries,
            nodata,
            decoded: HashMap::new(),
            loads: 0,
        }
    }

    fn load(&self, entry: &MosaicEntry) -> Result<Array2<u8>> {
        let mut band = TiffBand::open(&entry.path)
            .map_err(|e| ClassifyError::Mosaic(format!("cannot read tile {}: {}", entry.path.display(), e)))?;
        let tile_nodata = band.nodata;
        let values = band.read_window(&Tile::new(0, 0, entry.window.rows, entry.window.cols))?;
        Ok(values.mapv(|v| match tile_nodata {
            Some(nd) if v == nd => self.nodata,
            _ => v as u8,
        }))
    }

    fn fill(&mut self, row_off: usize, strip: &mut [u8], cols: usize) -> Result<()> {
        let entries = self.entries;
        let strip_tile = Tile::new(row_off, 0, strip.len() / cols, cols);

        // Tiles entirely above this strip are done
        self.decoded.retain(|&i, _| entries[i].window.row_end() > row_off);

        for (i, entry) in entries.iter().enumerate() {
            let Some(overlap) = entry.window.intersection(&strip_tile) else {
                continue;
            };
            if !self.decoded.contains_key(&i) {
                let labels = self.load(entry)?;
                self.loads += 1;
                self.decoded.insert(i, labels);
            }
            let Some(labels) = self.decoded.get(&i) else {
                continue;
            };

            for r in overlap.row_off..overlap.row_end() {
                let src = labels.row(r - entry.window.row_off);
                let dst = (r - row_off) * cols;
                for c in overlap.col_off..overlap.col_end() {
                    strip[dst + c] = src[c - entry.window.col_off];
                }
            }
        }
        Ok(())
    }
}

fn union_grid(placed: &[(PathBuf, Extent, GeoReference)]) -> Result<(Extent, GeoReference)> {
    let reference = &placed[0].2;
    let mut min_row = i64::MAX;
    let mut min_col = i64::MAX;
    let mut max_row = i64::MIN;
    let mut max_col = i64::MIN;

    for (path, extent, georef) in placed {
        let (row, col) = reference
            .transform
            .pixel_offset_of(&georef.transform)
            .map_err(|e| ClassifyError::Mosaic(format!("{}: {}", path.display(), e)))?;
        min_row = min_row.min(row);
        min_col = min_col.min(col);
        max_row = max_row.max(row + extent.rows as i64);
        max_col = max_col.max(col + extent.cols as i64);
    }

    let (x, y) = reference.transform.apply(min_row as f64, min_col as f64);
    let mut transform = reference.transform;
    transform.0[0] = x;
    transform.0[3] = y;

    let extent = Extent::new((max_row - min_row) as usize, (max_col - min_col) as usize);
    Ok((
        extent,
        GeoReference {
            transform,
            geokeys: reference.geokeys.clone(),
        },
    ))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Coverage {
    Full,
    Partial { missing: Vec<usize> },
}

#[derive(Debug, Clone, Serialize)]
pub struct MosaicSummary {
    pub path: PathBuf,
    pub extent: Extent,
    pub tiles_used: usize,
    pub coverage: Coverage,
}

/// Mosaic the written tiles of a run over the run's full extent.
///
/// Failed tiles are left as nodata and listed in the returned coverage.
pub fn assemble(report: &RunReport, destination: &Path, options: &WriteOptions) -> Result<MosaicSummary> {
    let paths = report.written_paths();
    let mosaic = VirtualMosaic::build(&paths, Some((report.extent, &report.georef)))?;
    mosaic.materialize(destination, options)?;

    let coverage = if report.failed.is_empty() {
        info!("Mosaic complete: all {} tiles present", paths.len());
        Coverage::Full
    } else {
        let missing: Vec<usize> = report.failed.iter().map(|f| f.index).collect();
        warn!(
            "Mosaic is PARTIAL: {} of {} tiles missing ({:?}), gaps filled with nodata",
            missing.len(),
            report.total_tiles(),
            missing
        );
        Coverage::Partial { missing }
    };

    Ok(MosaicSummary {
        path: destination.to_path_buf(),
        extent: report.extent,
        tiles_used: paths.len(),
        coverage,
    })
}
