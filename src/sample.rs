use crate::chunking::{Extent, Tile, TileGrid};
use crate::error::{ClassifyError, Result};
use crate::io::RasterSource;
use crate::predict::MissingValuePolicy;
use log::{debug, info};
use ndarray::{s, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Pixel coordinate (row, col).
pub type Point = (usize, usize);

/// Draw `count` pixel positions uniformly over the extent. Same seed, same points.
pub fn sample_within_extent(extent: Extent, count: usize, seed: u64) -> Vec<Point> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| (rng.gen_range(0..extent.rows), rng.gen_range(0..extent.cols)))
        .collect()
}

/// Read the band values under each point, dropping points with a missing band.
///
/// Points are bucketed by a tile grid of `block_rows x block_cols`. A tile
/// holding many points is read once as a whole; sparse points are read one
/// pixel at a time. Rows of the result follow the input order of the
/// surviving points.
pub fn extract_values<S: RasterSource + ?Sized>(
    source: &mut S,
    points: &[Point],
    policy: &MissingValuePolicy,
    block_rows: usize,
    block_cols: usize,
) -> Result<Array2<f64>> {
    let info = source.info().clone();
    let grid = TileGrid::new(info.extent, block_rows, block_cols)?;
    let bands = info.band_count;

    let mut buckets: Vec<Vec<usize>> = vec![Vec::new(); grid.total_tiles];
    for (i, &(row, col)) in points.iter().enumerate() {
        let tile_idx = grid.index_of(row, col).ok_or_else(|| {
            ClassifyError::InvalidArgument(format!(
                "sample point ({}, {}) is outside the {} raster",
                row, col, info.extent
            ))
        })?;
        buckets[tile_idx].push(i);
    }

    let mut values: Vec<Option<Vec<f64>>> = vec![None; points.len()];
    for (tile_idx, members) in buckets.iter().enumerate() {
        if members.is_empty() {
            continue;
        }
        let tile = grid.tile(tile_idx);

        // A 1x1 read decodes only the strip or tile holding the pixel; a
        // full window read decodes every chunk row of the tile.
        if members.len() < tile.rows {
            debug!("Sampling {} points from tile {} pixel by pixel", members.len(), tile_idx);
            for &i in members {
                let (row, col) = points[i];
                let block = source.read_window(&Tile::new(row, col, 1, 1))?;
                let px = block.data.slice(s![.., 0, 0]);
                if !policy.pixel_is_missing(px) {
                    values[i] = Some(px.to_vec());
                }
            }
            continue;
        }

        let block = source.read_window(&tile)?;
        debug!("Sampling {} points from tile {}", members.len(), tile_idx);
        for &i in members {
            let (row, col) = points[i];
            let px = block.data.slice(s![.., row - tile.row_off, col - tile.col_off]);
            if !policy.pixel_is_missing(px) {
                values[i] = Some(px.to_vec());
            }
        }
    }

    let kept: Vec<f64> = values.into_iter().flatten().flatten().collect();
    let n = kept.len() / bands.max(1);
    if n == 0 {
        return Err(ClassifyError::NoValidSamples(points.len()));
    }
    info!(
        "Extracted {} samples ({} discarded with missing values)",
        n,
        points.len() - n
    );
    Ok(Array2::from_shape_vec((n, bands), kept)?)
}
