// Library exports for testing and reuse

pub mod chunking;
pub mod cli;
pub mod cog;
pub mod error;
#[cfg(feature = "gdal")]
pub mod gdal_source;
pub mod geo;
pub mod io;
pub mod model;
pub mod mosaic;
pub mod pipeline;
pub mod predict;
pub mod sample;
pub mod scheduler;

// Re-export commonly used types
pub use chunking::{Extent, Tile, TileGrid};
pub use cog::{Compression, WriteOptions};
pub use error::{ClassifyError, Result, TileError, TileErrorKind};
pub use io::{Block, OpenSource, RasterSource, SourceInfo, TiffStack};
pub use model::{FitOptions, GmmClassifier};
pub use mosaic::{assemble, Coverage, MosaicSummary, VirtualMosaic};
pub use pipeline::{run_tiled_prediction, PipelineConfig, RunReport, TileOutput};
pub use predict::{Classifier, MissingValuePolicy};
pub use scheduler::{CancelToken, FailurePolicy, Scheduler};
