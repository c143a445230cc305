//! Input bands read through libgdal. Enabled with the `gdal` feature.

use crate::chunking::{Extent, Tile};
use crate::error::{ClassifyError, Result};
use crate::geo::{GeoReference, GeoTransform};
use crate::io::{Block, OpenSource, RasterSource, SampleType, SourceInfo};
use gdal::raster::{GdalDataType, RasterBand};
use gdal::Dataset;
use log::{debug, info, warn};
use ndarray::{s, Array2, Array3};
use std::path::{Path, PathBuf};

/// Any GDAL-readable single-band files stacked along the band axis.
#[derive(Debug, Clone)]
pub struct GdalStack {
    paths: Vec<PathBuf>,
    info: SourceInfo,
}

fn band_metadata(path: &Path) -> Result<(Extent, GeoReference, Option<f64>, SampleType)> {
    let dataset = Dataset::open(path)?;
    let rasterband: RasterBand = dataset.rasterband(1)?;

    let width = rasterband.x_size();
    let height = rasterband.y_size();
    if width == 0 || height == 0 {
        return Err(ClassifyError::InvalidDimensions(width, height));
    }
    if dataset.raster_count() > 1 {
        warn!(
            "{} has {} bands, only band 1 is used",
            path.display(),
            dataset.raster_count()
        );
    }

    let sample_type = match rasterband.band_type() {
        GdalDataType::Float32 => SampleType::Float32,
        GdalDataType::Float64 | GdalDataType::Unknown => SampleType::Float64,
        _ => SampleType::Integer,
    };
    let nodata = rasterband.no_data_value().map(|nd| sample_type.quantize(nd));
    let geotransform = dataset.geo_transform()?;
    if !dataset.projection().is_empty() {
        debug!("{}: projection is not carried into tile files", path.display());
    }

    Ok((
        Extent::new(height, width),
        GeoReference::new(GeoTransform(geotransform)),
        nodata,
        sample_type,
    ))
}

impl GdalStack {
    pub fn open_proxy<P: AsRef<Path>>(paths: &[P]) -> Result<(GdalStack, SourceInfo)> {
        if paths.is_empty() {
            return Err(ClassifyError::InvalidArgument(
                "at least one input band file is required".to_string(),
            ));
        }

        let paths: Vec<PathBuf> = paths.iter().map(|p| p.as_ref().to_path_buf()).collect();
        let mut first: Option<(Extent, GeoReference)> = None;
        let mut nodata = Vec::with_capacity(paths.len());
        let mut sample_types = Vec::with_capacity(paths.len());

        for path in &paths {
            info!("Opening input band with GDAL: {}", path.display());
            let (extent, georef, nd, sample_type) = band_metadata(path)?;
            if let Some((e, g)) = &first {
                if *e != extent || g.transform != georef.transform {
                    return Err(ClassifyError::BandMismatch {
                        path: path.clone(),
                        expected: format!("{} {:?}", e, g.transform.0),
                        found: format!("{} {:?}", extent, georef.transform.0),
                    });
                }
            } else {
                first = Some((extent, georef));
            }
            nodata.push(nd);
            sample_types.push(sample_type);
        }

        let (extent, georef) = first.unwrap_or((Extent::new(0, 0), GeoReference::default()));
        let info = SourceInfo {
            extent,
            band_count: paths.len(),
            georef,
            nodata,
            sample_types,
        };
        Ok((
            GdalStack {
                paths,
                info: info.clone(),
            },
            info,
        ))
    }
}

impl OpenSource for GdalStack {
    type Source = GdalStackReader;

    fn open(&self) -> Result<GdalStackReader> {
        let datasets = self
            .paths
            .iter()
            .map(Dataset::open)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(GdalStackReader {
            datasets,
            info: self.info.clone(),
        })
    }
}

/// Open datasets of one worker. GDAL handles are not shared between threads.
pub struct GdalStackReader {
    datasets: Vec<Dataset>,
    info: SourceInfo,
}

impl RasterSource for GdalStackReader {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    fn read_window(&mut self, tile: &Tile) -> Result<Block> {
        if !tile.fits_within(self.info.extent) {
            return Err(ClassifyError::WindowOutOfRange(
                tile.to_string(),
                self.info.extent.rows,
                self.info.extent.cols,
            ));
        }

        let mut data = Array3::<f64>::zeros((self.datasets.len(), tile.rows, tile.cols));
        for (i, dataset) in self.datasets.iter().enumerate() {
            let rasterband = dataset.rasterband(1)?;
            let buffer = rasterband.read_as::<f64>(
                (tile.col_off as isize, tile.row_off as isize),
                (tile.cols, tile.rows),
                (tile.cols, tile.rows),
                None,
            )?;
            let (_, data_vec) = buffer.into_shape_and_vec();
            let window = Array2::from_shape_vec((tile.rows, tile.cols), data_vec)?;
            data.slice_mut(s![i, .., ..]).assign(&window);
        }

        Ok(Block {
            tile: *tile,
            data,
            georef: self.info.georef.for_window(tile),
        })
    }
}
