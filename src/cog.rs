use crate::error::{ClassifyError, Result};
use log::{debug, info};
use std::fmt;
use std::path::Path;
use std::process::Command;
use std::str::FromStr;

/// Output label value reserved for unclassified or missing pixels.
pub const DEFAULT_NODATA: u8 = 0;

/// Strip height used when streaming a mosaic.
pub const DEFAULT_STRIP_ROWS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    None,
    Lzw,
    #[default]
    Deflate,
    Packbits,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "NONE",
            Compression::Lzw => "LZW",
            Compression::Deflate => "DEFLATE",
            Compression::Packbits => "PACKBITS",
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Compression {
    type Err = ClassifyError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "NONE" => Ok(Compression::None),
            "LZW" => Ok(Compression::Lzw),
            "DEFLATE" => Ok(Compression::Deflate),
            "PACKBITS" => Ok(Compression::Packbits),
            other => Err(ClassifyError::InvalidCompression(other.to_string())),
        }
    }
}

/// Encoding settings shared by tile files and the final mosaic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOptions {
    pub nodata: u8,
    pub compression: Compression,
    /// Rows per TIFF strip. Tile files ignore this and use one strip per tile.
    pub strip_rows: usize,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            nodata: DEFAULT_NODATA,
            compression: Compression::default(),
            strip_rows: DEFAULT_STRIP_ROWS,
        }
    }
}

/// Convert a finished mosaic into a Cloud-Optimized GeoTIFF using gdal_translate.
///
/// Returns `Ok(false)` when gdal_translate is not installed.
pub fn convert_to_cog(input_path: &Path, output_path: &Path, compression: Compression, block_size: usize) -> Result<bool> {
    if block_size == 0 || block_size % 16 != 0 {
        return Err(ClassifyError::InvalidArgument(format!(
            "COG block size {} must be a positive multiple of 16",
            block_size
        )));
    }

    info!("Converting to Cloud-Optimized GeoTIFF using gdal_translate...");

    let output = Command::new("gdal_translate")
        .arg("-of")
        .arg("COG")
        .arg("-co")
        .arg(format!("COMPRESS={}", compression))
        .arg("-co")
        .arg(format!("BLOCKSIZE={}", block_size))
        .arg("-co")
        .arg("BIGTIFF=IF_SAFER")
        .arg(input_path)
        .arg(output_path)
        .output();

    match output {
        Ok(result) => {
            if result.status.success() {
                info!("COG conversion successful: {}", output_path.display());
                Ok(true)
            } else {
                let stderr = String::from_utf8_lossy(&result.stderr);
                Err(ClassifyError::CogCreationFailed(format!(
                    "gdal_translate failed: {}",
                    stderr
                )))
            }
        }
        Err(e) => {
            debug!("gdal_translate not available ({}), skipping COG conversion", e);
            Ok(false)
        }
    }
}
