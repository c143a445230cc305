use clap::{Parser, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// Pure-Rust GeoTIFF reader
    Tiff,
    /// libgdal (requires the `gdal` feature)
    Gdal,
}

#[derive(Parser, Debug)]
#[command(name = "tiled-classify")]
#[command(about = "Unsupervised classification of a large band stack, tile by tile")]
#[command(version)]
#[command(author = "Huimori Project")]
pub struct Args {
    /// Input band files, one band per file, all on the same grid
    #[arg(short, long, value_name = "FILE", num_args = 1.., required = true)]
    pub input: Vec<PathBuf>,

    /// Output GeoTIFF path (single-band, 8-bit class labels)
    #[arg(short, long, value_name = "FILE")]
    pub output: PathBuf,

    /// Number of clusters to fit
    #[arg(short = 'k', long, default_value_t = 6)]
    pub clusters: usize,

    /// Number of random pixels sampled for fitting
    #[arg(long, default_value_t = 10_000)]
    pub samples: usize,

    /// Seed for sampling and model initialisation
    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// Block shape as ROWSxCOLS, or a single size for square blocks
    #[arg(short, long, value_name = "SHAPE", default_value = "2048")]
    pub block_size: String,

    /// Number of worker threads (default: all available)
    #[arg(short, long, value_name = "N")]
    pub threads: Option<usize>,

    /// Keep tile files in this directory (default: temporary, removed on exit)
    #[arg(long, value_name = "DIR")]
    pub tile_dir: Option<PathBuf>,

    /// Stop scheduling tiles after the first failure
    #[arg(long)]
    pub fail_fast: bool,

    /// Override input nodata value (default: read from each band)
    #[arg(long, value_name = "VALUE")]
    pub nodata: Option<f64>,

    /// Output compression: DEFLATE, LZW, PACKBITS or NONE
    #[arg(long, default_value = "DEFLATE")]
    pub compression: String,

    /// Use a previously saved model instead of fitting one
    #[arg(long, value_name = "FILE")]
    pub model: Option<PathBuf>,

    /// Save the fitted model as JSON
    #[arg(long, value_name = "FILE")]
    pub save_model: Option<PathBuf>,

    /// Write the run report as JSON
    #[arg(long, value_name = "FILE")]
    pub report: Option<PathBuf>,

    /// Also convert the mosaic to a Cloud-Optimized GeoTIFF at this path
    #[arg(long, value_name = "FILE")]
    pub cog: Option<PathBuf>,

    /// Raster reader used for the input bands
    #[arg(long, value_enum, default_value_t = Backend::Tiff)]
    pub backend: Backend,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

/// Parse `512`, `512x256` or `512X256` into (rows, cols).
pub fn parse_block_shape(s: &str) -> Option<(usize, usize)> {
    let s = s.trim();
    let (rows, cols) = match s.split_once(|c: char| c == 'x' || c == 'X') {
        Some((r, c)) => (r.trim().parse().ok()?, c.trim().parse().ok()?),
        None => {
            let n = s.parse().ok()?;
            (n, n)
        }
    };
    if rows == 0 || cols == 0 {
        return None;
    }
    Some((rows, cols))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_block_shape() {
        assert_eq!(parse_block_shape("2048"), Some((2048, 2048)));
        assert_eq!(parse_block_shape("512x256"), Some((512, 256)));
        assert_eq!(parse_block_shape(" 64X32 "), Some((64, 32)));
        assert_eq!(parse_block_shape("0x32"), None);
        assert_eq!(parse_block_shape("abc"), None);
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from([
            "tiled-classify",
            "-i",
            "b1.tif",
            "b2.tif",
            "-o",
            "out.tif",
            "-k",
            "4",
            "--fail-fast",
        ])
        .unwrap();
        assert_eq!(args.input.len(), 2);
        assert_eq!(args.clusters, 4);
        assert!(args.fail_fast);
        assert_eq!(args.backend, Backend::Tiff);
    }
}
