use crate::chunking::{Extent, Tile};
use crate::cog::{Compression, WriteOptions};
use crate::error::{ClassifyError, Result};
use crate::geo::GeoReference;
use log::{debug, info};
use ndarray::{s, Array2, Array3};
use std::fs::File;
use std::io::{BufReader, BufWriter, Seek, Write};
use std::path::{Path, PathBuf};
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::compression::{self as tiff_compression, CompressionAlgorithm, Deflate, Lzw, Packbits, Uncompressed};
use tiff::encoder::{colortype, TiffEncoder, TiffKind};
use tiff::tags::{CompressionMethod, PhotometricInterpretation, SampleFormat, Tag};
use tiff::ColorType;

/// Outputs bigger than this are written as BigTIFF.
const BIGTIFF_THRESHOLD: u64 = 4_000_000_000;

/// Metadata of a band stack, available without reading any pixels.
#[derive(Debug, Clone)]
pub struct SourceInfo {
    pub extent: Extent,
    pub band_count: usize,
    pub georef: GeoReference,
    /// Declared nodata value per band, in band order, rounded to the band's
    /// sample type.
    pub nodata: Vec<Option<f64>>,
    pub sample_types: Vec<SampleType>,
}

/// Storage type of a band's samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleType {
    Integer,
    Float32,
    Float64,
}

impl SampleType {
    /// The value a stored sample holds when `value` is written to this band.
    /// Nodata is compared against widened samples, so it must be rounded the same way.
    pub fn quantize(self, value: f64) -> f64 {
        if value.is_nan() {
            return value;
        }
        match self {
            SampleType::Integer => value.round(),
            SampleType::Float32 => value as f32 as f64,
            SampleType::Float64 => value,
        }
    }
}

/// Pixels of one tile for every band, shaped (bands, rows, cols).
#[derive(Debug, Clone)]
pub struct Block {
    pub tile: Tile,
    pub data: Array3<f64>,
    pub georef: GeoReference,
}

impl Block {
    pub fn band_count(&self) -> usize {
        self.data.dim().0
    }
}

/// An opened, readable band stack. One instance per worker; never shared.
pub trait RasterSource {
    fn info(&self) -> &SourceInfo;

    /// Read exactly the tile's window from every band.
    fn read_window(&mut self, tile: &Tile) -> Result<Block>;
}

/// Recipe for opening a band stack. Shared read-only between workers.
pub trait OpenSource: Sync {
    type Source: RasterSource;

    fn open(&self) -> Result<Self::Source>;
}

/// Single-band GeoTIFF files stacked along the band axis.
#[derive(Debug, Clone)]
pub struct TiffStack {
    paths: Vec<PathBuf>,
    info: SourceInfo,
}

impl TiffStack {
    /// Open every band file's header and check that they describe the same grid.
    pub fn open_proxy<P: AsRef<Path>>(paths: &[P]) -> Result<(TiffStack, SourceInfo)> {
        if paths.is_empty() {
            return Err(ClassifyError::InvalidArgument(
                "at least one input band file is required".to_string(),
            ));
        }

        let paths: Vec<PathBuf> = paths.iter().map(|p| p.as_ref().to_path_buf()).collect();
        let mut extent: Option<Extent> = None;
        let mut georef: Option<GeoReference> = None;
        let mut nodata = Vec::with_capacity(paths.len());
        let mut sample_types = Vec::with_capacity(paths.len());

        for path in &paths {
            info!("Opening input band: {}", path.display());
            let band = TiffBand::open(path)?;

            match (extent, &georef) {
                (Some(e), Some(g)) => {
                    if e != band.extent {
                        return Err(ClassifyError::BandMismatch {
                            path: path.clone(),
                            expected: e.to_string(),
                            found: band.extent.to_string(),
                        });
                    }
                    if g.transform != band.georef.transform {
                        return Err(ClassifyError::BandMismatch {
                            path: path.clone(),
                            expected: format!("{:?}", g.transform.0),
                            found: format!("{:?}", band.georef.transform.0),
                        });
                    }
                }
                _ => {
                    extent = Some(band.extent);
                    georef = Some(band.georef.clone());
                }
            }
            nodata.push(band.nodata);
            sample_types.push(band.sample_type);
        }

        let info = SourceInfo {
            extent: extent.unwrap_or(Extent::new(0, 0)),
            band_count: paths.len(),
            georef: georef.unwrap_or_default(),
            nodata,
            sample_types,
        };
        debug!(
            "Band stack: {} bands, {} pixels, nodata={:?}",
            info.band_count, info.extent, info.nodata
        );

        Ok((
            TiffStack {
                paths,
                info: info.clone(),
            },
            info,
        ))
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}

impl OpenSource for TiffStack {
    type Source = TiffStackReader;

    fn open(&self) -> Result<TiffStackReader> {
        let bands = self
            .paths
            .iter()
            .map(|p| TiffBand::open(p))
            .collect::<Result<Vec<_>>>()?;
        Ok(TiffStackReader {
            bands,
            info: self.info.clone(),
        })
    }
}

pub struct TiffStackReader {
    bands: Vec<TiffBand>,
    info: SourceInfo,
}

impl RasterSource for TiffStackReader {
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

        let mut data = Array3::<f64>::zeros((self.bands.len(), tile.rows, tile.cols));
        for (i, band) in self.bands.iter_mut().enumerate() {
            let window = band.read_window(tile)?;
            data.slice_mut(s![i, .., ..]).assign(&window);
        }

        Ok(Block {
            tile: *tile,
            data,
            georef: self.info.georef.for_window(tile),
        })
    }
}

/// One open single-band TIFF. Reads decode only the strips/tiles a window touches.
pub struct TiffBand {
    path: PathBuf,
    decoder: Decoder<BufReader<File>>,
    pub extent: Extent,
    pub georef: GeoReference,
    /// Declared nodata, already rounded to `sample_type`.
    pub nodata: Option<f64>,
    pub sample_type: SampleType,
}

impl TiffBand {
    pub fn open(path: &Path) -> Result<TiffBand> {
        let file = File::open(path)?;
        let mut decoder = Decoder::new(BufReader::new(file))?.with_limits(Limits::unlimited());

        let (width, height) = decoder.dimensions()?;
        let (width, height) = (width as usize, height as usize);
        if width == 0 || height == 0 {
            return Err(ClassifyError::InvalidDimensions(width, height));
        }

        let bits = match decoder.colortype()? {
            ColorType::Gray(bits) => bits,
            other => {
                return Err(ClassifyError::UnsupportedPixelFormat(
                    path.to_path_buf(),
                    format!("{:?} (expected one band per file)", other),
                ))
            }
        };
        let format = match decoder.find_tag(Tag::SampleFormat)? {
            Some(value) => value
                .into_u16_vec()?
                .first()
                .map(|&v| SampleFormat::from_u16_exhaustive(v))
                .unwrap_or(SampleFormat::Uint),
            None => SampleFormat::Uint,
        };
        let sample_type = match (format, bits) {
            (SampleFormat::IEEEFP, 32) => SampleType::Float32,
            (SampleFormat::IEEEFP, _) => SampleType::Float64,
            _ => SampleType::Integer,
        };

        let (georef, nodata) = GeoReference::read_tags(&mut decoder)?;
        let nodata = nodata.map(|nd| sample_type.quantize(nd));

        Ok(TiffBand {
            path: path.to_path_buf(),
            decoder,
            extent: Extent::new(height, width),
            georef,
            nodata,
            sample_type,
        })
    }

    pub fn read_window(&mut self, tile: &Tile) -> Result<Array2<f64>> {
        if !tile.fits_within(self.extent) {
            return Err(ClassifyError::WindowOutOfRange(
                tile.to_string(),
                self.extent.rows,
                self.extent.cols,
            ));
        }

        let (chunk_w, chunk_h) = self.decoder.chunk_dimensions();
        let (chunk_w, chunk_h) = (chunk_w as usize, chunk_h as usize);
        let chunks_across = (self.extent.cols + chunk_w - 1) / chunk_w;

        debug!(
            "Reading {} from {} ({}x{} chunks)",
            tile,
            self.path.display(),
            chunk_h,
            chunk_w
        );

        let mut out = Array2::<f64>::zeros((tile.rows, tile.cols));
        for chunk_row in tile.row_off / chunk_h..=(tile.row_end() - 1) / chunk_h {
            for chunk_col in tile.col_off / chunk_w..=(tile.col_end() - 1) / chunk_w {
                let index = (chunk_row * chunks_across + chunk_col) as u32;
                let (data_w, data_h) = self.decoder.chunk_data_dimensions(index);
                let chunk = Tile::new(
                    chunk_row * chunk_h,
                    chunk_col * chunk_w,
                    data_h as usize,
                    data_w as usize,
                );
                let Some(overlap) = chunk.intersection(tile) else {
                    continue;
                };

                let values = decoded_to_f64(self.decoder.read_chunk(index)?, &self.path)?;
                let stride = chunk.cols;
                for r in overlap.row_off..overlap.row_end() {
                    let src = (r - chunk.row_off) * stride;
                    for c in overlap.col_off..overlap.col_end() {
                        out[[r - tile.row_off, c - tile.col_off]] = values[src + c - chunk.col_off];
                    }
                }
            }
        }
        Ok(out)
    }
}

fn decoded_to_f64(result: DecodingResult, path: &Path) -> Result<Vec<f64>> {
    Ok(match result {
        DecodingResult::U8(buf) => buf.into_iter().map(f64::from).collect(),
        DecodingResult::U16(buf) => buf.into_iter().map(f64::from).collect(),
        DecodingResult::U32(buf) => buf.into_iter().map(f64::from).collect(),
        DecodingResult::U64(buf) => buf.into_iter().map(|v| v as f64).collect(),
        DecodingResult::I8(buf) => buf.into_iter().map(f64::from).collect(),
        DecodingResult::I16(buf) => buf.into_iter().map(f64::from).collect(),
        DecodingResult::I32(buf) => buf.into_iter().map(f64::from).collect(),
        DecodingResult::I64(buf) => buf.into_iter().map(|v| v as f64).collect(),
        DecodingResult::F32(buf) => buf.into_iter().map(f64::from).collect(),
        DecodingResult::F64(buf) => buf,
        #[allow(unreachable_patterns)]
        _ => {
            return Err(ClassifyError::UnsupportedPixelFormat(
                path.to_path_buf(),
                "unknown sample format".to_string(),
            ))
        }
    })
}

/// Write a single-band u8 GeoTIFF of `extent`, one strip at a time.
///
/// `fill(row_off, strip)` receives a strip pre-filled with the nodata value,
/// `strip.len() == rows_in_strip * extent.cols`.
pub fn write_label_raster<F>(
    path: &Path,
    extent: Extent,
    georef: &GeoReference,
    options: &WriteOptions,
    fill: F,
) -> Result<()>
where
    F: FnMut(usize, &mut [u8]) -> Result<()>,
{
    if extent.rows == 0 || extent.cols == 0 {
        return Err(ClassifyError::InvalidDimensions(extent.rows, extent.cols));
    }
    if u32::try_from(extent.rows).is_err() || u32::try_from(extent.cols).is_err() {
        return Err(ClassifyError::InvalidDimensions(extent.rows, extent.cols));
    }

    let writer = BufWriter::new(File::create(path)?);
    if extent.pixel_count() as u64 > BIGTIFF_THRESHOLD {
        debug!("Writing {} as BigTIFF", path.display());
        with_compression(TiffEncoder::new_big(writer)?, extent, georef, options, fill)
    } else {
        with_compression(TiffEncoder::new(writer)?, extent, georef, options, fill)
    }
}

fn with_compression<W, K, F>(
    encoder: TiffEncoder<W, K>,
    extent: Extent,
    georef: &GeoReference,
    options: &WriteOptions,
    fill: F,
) -> Result<()>
where
    W: Write + Seek,
    K: TiffKind,
    F: FnMut(usize, &mut [u8]) -> Result<()>,
{
    match options.compression {
        Compression::None => write_strips(encoder, Uncompressed, extent, georef, options, fill),
        Compression::Lzw => write_strips(encoder, Lzw, extent, georef, options, fill),
        Compression::Deflate => write_strips(encoder, Deflate::default(), extent, georef, options, fill),
        Compression::Packbits => write_strips(encoder, Packbits, extent, georef, options, fill),
    }
}

/// Strips are compressed here and stored as raw chunks: `ImageEncoder::write_strip`
/// only compresses when called from `write_data`.
fn write_strips<W, K, D, F>(
    mut encoder: TiffEncoder<W, K>,
    mut compression: D,
    extent: Extent,
    georef: &GeoReference,
    options: &WriteOptions,
    mut fill: F,
) -> Result<()>
where
    W: Write + Seek,
    K: TiffKind,
    D: tiff_compression::Compression,
    F: FnMut(usize, &mut [u8]) -> Result<()>,
{
    let strip_rows = options.strip_rows.clamp(1, extent.rows);
    let mut dir = encoder.new_directory()?;
    dir.write_tag(Tag::ImageWidth, extent.cols as u32)?;
    dir.write_tag(Tag::ImageLength, extent.rows as u32)?;
    dir.write_tag(Tag::BitsPerSample, 8u16)?;
    dir.write_tag(Tag::SamplesPerPixel, 1u16)?;
    dir.write_tag(Tag::SampleFormat, SampleFormat::Uint.to_u16())?;
    dir.write_tag(
        Tag::PhotometricInterpretation,
        PhotometricInterpretation::BlackIsZero.to_u16(),
    )?;
    dir.write_tag(Tag::Compression, D::COMPRESSION_METHOD.to_u16())?;
    dir.write_tag(Tag::RowsPerStrip, strip_rows as u32)?;
    georef.write_tags(&mut dir, Some(f64::from(options.nodata)))?;

    // PackBits runs must not cross row boundaries
    let per_row = matches!(D::COMPRESSION_METHOD, CompressionMethod::PackBits);

    let mut offsets = Vec::new();
    let mut byte_counts = Vec::new();
    let mut strip = Vec::with_capacity(strip_rows * extent.cols);
    let mut packed = Vec::new();
    let mut row = 0;
    while row < extent.rows {
        let rows = strip_rows.min(extent.rows - row);
        strip.clear();
        strip.resize(rows * extent.cols, options.nodata);
        fill(row, &mut strip)?;

        packed.clear();
        if per_row {
            for line in strip.chunks(extent.cols) {
                compression.write_to(&mut packed, line)?;
            }
        } else {
            compression.write_to(&mut packed, &strip)?;
        }

        let offset = dir.write_data(&packed[..])?;
        offsets.push(K::convert_offset(offset)?);
        byte_counts.push(K::convert_offset(packed.len() as u64)?);
        row += rows;
    }

    dir.write_tag(Tag::StripOffsets, K::convert_slice(&offsets))?;
    dir.write_tag(Tag::StripByteCounts, K::convert_slice(&byte_counts))?;
    dir.finish()?;
    Ok(())
}

/// Read a whole single-band raster into memory. Meant for small rasters and tests.
pub fn read_band(path: &Path) -> Result<(Array2<f64>, GeoReference, Option<f64>)> {
    let mut band = TiffBand::open(path)?;
    let extent = band.extent;
    let data = band.read_window(&Tile::new(0, 0, extent.rows, extent.cols))?;
    Ok((data, band.georef.clone(), band.nodata))
}

/// Write a whole in-memory band as a Float32 GeoTIFF with the given strip height.
pub fn write_f32_band(
    path: &Path,
    data: &Array2<f32>,
    georef: &GeoReference,
    nodata: Option<f64>,
    strip_rows: usize,
) -> Result<()> {
    let (rows, cols) = data.dim();
    if rows == 0 || cols == 0 {
        return Err(ClassifyError::InvalidDimensions(rows, cols));
    }
    let writer = BufWriter::new(File::create(path)?);
    let mut encoder = TiffEncoder::new(writer)?;
    let mut image = encoder.new_image::<colortype::Gray32Float>(cols as u32, rows as u32)?;
    georef.write_tags(image.encoder(), nodata)?;

    let strip_rows = strip_rows.clamp(1, rows);
    image.rows_per_strip(strip_rows as u32)?;
    let mut row = 0;
    while row < rows {
        let n = strip_rows.min(rows - row);
        let strip: Vec<f32> = data.slice(s![row..row + n, ..]).iter().copied().collect();
        image.write_strip(&strip)?;
        row += n;
    }
    image.finish()?;
    Ok(())
}
