use clap::Parser;
use env_logger::Env;
use log::{info, warn};
use std::path::Path;

use geotiff_tiled_classify::cli::{parse_block_shape, Args, Backend};
use geotiff_tiled_classify::cog::{self, Compression, WriteOptions};
use geotiff_tiled_classify::error::{ClassifyError, Result};
use geotiff_tiled_classify::io::{OpenSource, SourceInfo, TiffStack};
use geotiff_tiled_classify::model::{FitOptions, GmmClassifier};
use geotiff_tiled_classify::mosaic::{assemble, Coverage};
use geotiff_tiled_classify::pipeline::{default_concurrency, run_tiled_prediction, PipelineConfig};
use geotiff_tiled_classify::sample::{extract_values, sample_within_extent};
use geotiff_tiled_classify::scheduler::{CancelToken, FailurePolicy};

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logger
    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level)).init();

    info!("=== Tiled GeoTIFF Classifier ===");

    // Validate arguments before touching any data
    let (block_rows, block_cols) = parse_block_shape(&args.block_size).ok_or_else(|| {
        ClassifyError::InvalidArgument(format!("invalid block size '{}'", args.block_size))
    })?;
    let compression: Compression = args.compression.parse()?;
    let concurrency = args.threads.unwrap_or_else(default_concurrency);
    if concurrency == 0 {
        return Err(ClassifyError::InvalidArgument("--threads must be at least 1".to_string()));
    }
    info!("Using {} worker threads", concurrency);

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        warn!("Interrupt received, finishing in-flight tiles and stopping");
        handler_token.cancel();
    }) {
        warn!("Could not install interrupt handler: {}", e);
    }

    // Tiles go to a scratch directory next to the output unless asked to keep them.
    // The TempDir is removed when it drops, on success and on error.
    let scratch = match &args.tile_dir {
        Some(_) => None,
        None => {
            let parent = args
                .output
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            Some(tempfile::Builder::new().prefix(".tiles-").tempdir_in(parent)?)
        }
    };
    let tile_dir = match (&args.tile_dir, &scratch) {
        (Some(dir), _) => dir.clone(),
        (None, Some(tmp)) => tmp.path().to_path_buf(),
        (None, None) => unreachable!("scratch directory is created when no tile dir is given"),
    };

    let config = PipelineConfig {
        block_rows,
        block_cols,
        concurrency,
        tile_dir,
        tile_dir_is_temporary: scratch.is_some(),
        failure_policy: if args.fail_fast {
            FailurePolicy::FailFast
        } else {
            FailurePolicy::BestEffort
        },
        write: WriteOptions {
            compression,
            ..WriteOptions::default()
        },
        nodata_override: args.nodata,
        cancel,
    };

    match args.backend {
        Backend::Tiff => {
            let (stack, info) = TiffStack::open_proxy(&args.input)?;
            classify(&stack, &info, &args, &config)?;
        }
        #[cfg(feature = "gdal")]
        Backend::Gdal => {
            let (stack, info) = geotiff_tiled_classify::gdal_source::GdalStack::open_proxy(&args.input)?;
            classify(&stack, &info, &args, &config)?;
        }
        #[cfg(not(feature = "gdal"))]
        Backend::Gdal => {
            return Err(ClassifyError::InvalidArgument(
                "this build has no GDAL support (rebuild with --features gdal)".to_string(),
            ));
        }
    }

    drop(scratch);
    info!("=== Done! ===");
    Ok(())
}

fn classify<O: OpenSource>(opener: &O, info: &SourceInfo, args: &Args, config: &PipelineConfig) -> Result<()> {
    info!(
        "Input: {} bands, {} pixels, nodata={:?}",
        info.band_count, info.extent, info.nodata
    );

    let model = match &args.model {
        Some(path) => GmmClassifier::load(path)?,
        None => {
            let policy = config.missing_value_policy(info);
            let mut source = opener.open()?;
            let points = sample_within_extent(info.extent, args.samples, args.seed);
            let samples = extract_values(&mut source, &points, &policy, config.block_rows, config.block_cols)?;
            let options = FitOptions {
                seed: args.seed,
                ..FitOptions::default()
            };
            GmmClassifier::fit(&samples, args.clusters, &options)?
        }
    };
    if let Some(path) = &args.save_model {
        model.save(path)?;
    }

    let report = run_tiled_prediction(opener, info, &model, config)?;
    report.log_summary();

    let write_report = |mosaic: Option<&geotiff_tiled_classify::MosaicSummary>| -> Result<()> {
        if let Some(path) = &args.report {
            let file = std::fs::File::create(path)?;
            serde_json::to_writer_pretty(file, &serde_json::json!({ "run": &report, "mosaic": mosaic }))?;
            info!("Run report written to {}", path.display());
        }
        Ok(())
    };

    if config.cancel.is_cancelled() {
        write_report(None)?;
        if config.tile_dir_is_temporary {
            warn!("Tiles were written to a temporary directory and will be removed; use --tile-dir to keep them");
        }
        return Err(ClassifyError::Cancelled);
    }
    if report.written.is_empty() {
        write_report(None)?;
        return Err(ClassifyError::Mosaic("every tile failed, nothing to assemble".to_string()));
    }

    let summary = assemble(&report, &args.output, &config.write)?;
    match &summary.coverage {
        Coverage::Full => info!("Mosaic ran on the full tile set"),
        Coverage::Partial { missing } => warn!(
            "Mosaic ran on a PARTIAL tile set: {} tiles missing {:?}",
            missing.len(),
            missing
        ),
    }
    write_report(Some(&summary))?;

    if let Some(cog_path) = &args.cog {
        let converted = cog::convert_to_cog(&args.output, cog_path, config.write.compression, 512)?;
        if !converted {
            warn!("gdal_translate not found, no COG written");
        }
    }

    info!("Output written to {}", args.output.display());
    Ok(())
}
