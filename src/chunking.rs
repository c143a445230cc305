use crate::error::{ClassifyError, Result};
use log::debug;
use serde::Serialize;
use std::fmt;

/// Size of a raster grid in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Extent {
    pub rows: usize,
    pub cols: usize,
}

impl Extent {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols }
    }

    pub fn pixel_count(&self) -> usize {
        self.rows * self.cols
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.rows, self.cols)
    }
}

/// A rectangular window of the grid, in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Tile {
    pub row_off: usize,
    pub col_off: usize,
    pub rows: usize,
    pub cols: usize,
}

impl Tile {
    pub fn new(row_off: usize, col_off: usize, rows: usize, cols: usize) -> Self {
        Self {
            row_off,
            col_off,
            rows,
            cols,
        }
    }

    /// One past the last row covered by this tile.
    pub fn row_end(&self) -> usize {
        self.row_off + self.rows
    }

    /// One past the last column covered by this tile.
    pub fn col_end(&self) -> usize {
        self.col_off + self.cols
    }

    pub fn pixel_count(&self) -> usize {
        self.rows * self.cols
    }

    pub fn fits_within(&self, extent: Extent) -> bool {
        self.rows > 0 && self.cols > 0 && self.row_end() <= extent.rows && self.col_end() <= extent.cols
    }

    /// Overlapping window of two tiles, if any.
    pub fn intersection(&self, other: &Tile) -> Option<Tile> {
        let row_off = self.row_off.max(other.row_off);
        let col_off = self.col_off.max(other.col_off);
        let row_end = self.row_end().min(other.row_end());
        let col_end = self.col_end().min(other.col_end());
        if row_off >= row_end || col_off >= col_end {
            return None;
        }
        Some(Tile::new(row_off, col_off, row_end - row_off, col_end - col_off))
    }

    pub fn contains(&self, row: usize, col: usize) -> bool {
        row >= self.row_off && row < self.row_end() && col >= self.col_off && col < self.col_end()
    }
}

impl fmt::Display for Tile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rows {}..{}, cols {}..{}",
            self.row_off,
            self.row_end(),
            self.col_off,
            self.col_end()
        )
    }
}

/// Row-major partition of an extent into blocks. Edge tiles are clipped.
#[derive(Debug, Clone)]
pub struct TileGrid {
    extent: Extent,
    block_rows: usize,
    block_cols: usize,
    pub num_tiles_x: usize,
    pub num_tiles_y: usize,
    pub total_tiles: usize,
}

impl TileGrid {
    pub fn new(extent: Extent, block_rows: usize, block_cols: usize) -> Result<Self> {
        if extent.rows == 0 || extent.cols == 0 {
            return Err(ClassifyError::InvalidArgument(format!(
                "raster extent must be positive, got {}",
                extent
            )));
        }
        if block_rows == 0 || block_cols == 0 {
            return Err(ClassifyError::InvalidArgument(format!(
                "block shape must be positive, got {}x{}",
                block_rows, block_cols
            )));
        }

        // Ceiling division
        let num_tiles_x = (extent.cols + block_cols - 1) / block_cols;
        let num_tiles_y = (extent.rows + block_rows - 1) / block_rows;
        let total_tiles = num_tiles_x * num_tiles_y;

        debug!(
            "TileGrid: {} raster, block={}x{} → {}x{} tiles ({} total)",
            extent, block_rows, block_cols, num_tiles_y, num_tiles_x, total_tiles
        );

        Ok(Self {
            extent,
            block_rows,
            block_cols,
            num_tiles_x,
            num_tiles_y,
            total_tiles,
        })
    }

    pub fn extent(&self) -> Extent {
        self.extent
    }

    pub fn block_shape(&self) -> (usize, usize) {
        (self.block_rows, self.block_cols)
    }

    pub fn iter(&self) -> TileIterator<'_> {
        TileIterator::new(self)
    }

    pub fn tiles(&self) -> Vec<Tile> {
        self.iter().map(|(_, tile)| tile).collect()
    }

    /// Tile at a zero-based row-major index. Panics if `index >= total_tiles`.
    pub fn tile(&self, index: usize) -> Tile {
        assert!(index < self.total_tiles, "tile index {} out of range", index);

        let tile_y = index / self.num_tiles_x;
        let tile_x = index % self.num_tiles_x;

        let row_off = tile_y * self.block_rows;
        let col_off = tile_x * self.block_cols;
        let row_end = ((tile_y + 1) * self.block_rows).min(self.extent.rows);
        let col_end = ((tile_x + 1) * self.block_cols).min(self.extent.cols);

        Tile::new(row_off, col_off, row_end - row_off, col_end - col_off)
    }

    /// Index of the tile containing the given pixel.
    pub fn index_of(&self, row: usize, col: usize) -> Option<usize> {
        if row >= self.extent.rows || col >= self.extent.cols {
            return None;
        }
        Some((row / self.block_rows) * self.num_tiles_x + col / self.block_cols)
    }
}

pub struct TileIterator<'a> {
    grid: &'a TileGrid,
    current_idx: usize,
}

impl<'a> TileIterator<'a> {
    fn new(grid: &'a TileGrid) -> Self {
        Self {
            grid,
            current_idx: 0,
        }
    }
}

impl<'a> Iterator for TileIterator<'a> {
    type Item = (usize, Tile);

    fn next(&mut self) -> Option<Self::Item> {
        if self.current_idx < self.grid.total_tiles {
            let tile = self.grid.tile(self.current_idx);
            let idx = self.current_idx;
            self.current_idx += 1;
            Some((idx, tile))
        } else {
            None
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.grid.total_tiles - self.current_idx;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for TileIterator<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_tile_grid_even_split() {
        let grid = TileGrid::new(Extent::new(4096, 4096), 2048, 2048).unwrap();
        assert_eq!(grid.total_tiles, 4);

        let tiles = grid.tiles();
        assert_eq!(tiles[0], Tile::new(0, 0, 2048, 2048));
        assert_eq!(tiles[1], Tile::new(0, 2048, 2048, 2048));
        assert_eq!(tiles[2], Tile::new(2048, 0, 2048, 2048));
        assert_eq!(tiles[3], Tile::new(2048, 2048, 2048, 2048));
    }

    #[test]
    fn test_tile_grid_clips_edges() {
        // 5000 rows x 3000 cols: row bands 2048, 2048, 904; col bands 2048, 952
        let grid = TileGrid::new(Extent::new(5000, 3000), 2048, 2048).unwrap();
        assert_eq!(grid.num_tiles_y, 3);
        assert_eq!(grid.num_tiles_x, 2);

        let last = grid.tile(grid.total_tiles - 1);
        assert_eq!(last, Tile::new(4096, 2048, 904, 952));
        assert_eq!(grid.tile(1).cols, 952);
    }

    #[test]
    fn test_tile_grid_square_3000() {
        // 3000x3000 with 2048 blocks → 2 bands of (2048, 952) each way
        let grid = TileGrid::new(Extent::new(3000, 3000), 2048, 2048).unwrap();
        let tiles = grid.tiles();
        assert_eq!(tiles.len(), 4);
        assert_eq!(tiles[3], Tile::new(2048, 2048, 952, 952));
    }

    #[test]
    fn test_block_larger_than_extent() {
        let grid = TileGrid::new(Extent::new(10, 20), 512, 512).unwrap();
        assert_eq!(grid.tiles(), vec![Tile::new(0, 0, 10, 20)]);
    }

    #[test]
    fn test_invalid_arguments() {
        assert!(matches!(
            TileGrid::new(Extent::new(0, 10), 4, 4),
            Err(ClassifyError::InvalidArgument(_))
        ));
        assert!(matches!(
            TileGrid::new(Extent::new(10, 10), 4, 0),
            Err(ClassifyError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_index_of_matches_tile() {
        let grid = TileGrid::new(Extent::new(100, 70), 32, 25).unwrap();
        for (idx, tile) in grid.iter() {
            assert_eq!(grid.index_of(tile.row_off, tile.col_off), Some(idx));
            assert_eq!(grid.index_of(tile.row_end() - 1, tile.col_end() - 1), Some(idx));
        }
        assert_eq!(grid.index_of(100, 0), None);
    }

    #[test]
    fn test_intersection() {
        let a = Tile::new(0, 0, 10, 10);
        let b = Tile::new(5, 8, 10, 10);
        assert_eq!(a.intersection(&b), Some(Tile::new(5, 8, 5, 2)));
        assert_eq!(a.intersection(&Tile::new(10, 0, 3, 3)), None);
    }

    proptest! {
        #[test]
        fn prop_tiles_partition_extent(
            rows in 1usize..300,
            cols in 1usize..300,
            block_rows in 1usize..80,
            block_cols in 1usize..80,
        ) {
            let extent = Extent::new(rows, cols);
            let grid = TileGrid::new(extent, block_rows, block_cols).unwrap();
            let tiles = grid.tiles();

            let expected = ((rows + block_rows - 1) / block_rows) * ((cols + block_cols - 1) / block_cols);
            prop_assert_eq!(tiles.len(), expected);

            let mut covered = vec![0u8; rows * cols];
            for tile in &tiles {
                prop_assert!(tile.fits_within(extent));
                for r in tile.row_off..tile.row_end() {
                    for c in tile.col_off..tile.col_end() {
                        covered[r * cols + c] += 1;
                    }
                }
            }
            prop_assert!(covered.iter().all(|&n| n == 1));

            // Row-major: offsets never decrease in (row, col) order
            for pair in tiles.windows(2) {
                prop_assert!((pair[0].row_off, pair[0].col_off) < (pair[1].row_off, pair[1].col_off));
            }
        }
    }
}
