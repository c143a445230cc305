//! Georeferencing: the affine geotransform of a grid and the GeoTIFF tags
//! that carry it.

use crate::chunking::Tile;
use crate::error::{ClassifyError, Result};
use log::{debug, warn};
use serde::Serialize;
use std::io::{Read, Seek, Write};
use tiff::decoder::Decoder;
use tiff::encoder::{DirectoryEncoder, TiffKind};
use tiff::tags::Tag;

const MODEL_PIXEL_SCALE: u16 = 33550;
const MODEL_TIEPOINT: u16 = 33922;
const MODEL_TRANSFORMATION: u16 = 34264;
const GEO_KEY_DIRECTORY: u16 = 34735;
const GEO_DOUBLE_PARAMS: u16 = 34736;
const GEO_ASCII_PARAMS: u16 = 34737;
const GDAL_NODATA: u16 = 42113;

/// Pixel offsets derived from world coordinates must land this close to an
/// integer to count as being on the same grid.
const GRID_TOLERANCE: f64 = 1e-6;

fn tag(code: u16) -> Tag {
    Tag::from_u16_exhaustive(code)
}

/// GDAL-ordered affine transform: `[origin_x, px_w, row_rot, origin_y, col_rot, px_h]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GeoTransform(pub [f64; 6]);

impl Default for GeoTransform {
    fn default() -> Self {
        GeoTransform([0.0, 1.0, 0.0, 0.0, 0.0, 1.0])
    }
}

impl GeoTransform {
    pub fn origin(&self) -> (f64, f64) {
        (self.0[0], self.0[3])
    }

    pub fn pixel_size(&self) -> (f64, f64) {
        (self.0[1], self.0[5])
    }

    pub fn is_north_up(&self) -> bool {
        self.0[2] == 0.0 && self.0[4] == 0.0
    }

    /// World coordinates of the top-left corner of pixel (row, col).
    pub fn apply(&self, row: f64, col: f64) -> (f64, f64) {
        let g = &self.0;
        (g[0] + col * g[1] + row * g[2], g[3] + col * g[4] + row * g[5])
    }

    /// Transform of a sub-window whose top-left pixel is the tile's offset.
    pub fn for_window(&self, tile: &Tile) -> GeoTransform {
        let (x, y) = self.apply(tile.row_off as f64, tile.col_off as f64);
        let mut g = self.0;
        g[0] = x;
        g[3] = y;
        GeoTransform(g)
    }

    pub fn same_grid_spacing(&self, other: &GeoTransform) -> bool {
        let close = |a: f64, b: f64| (a - b).abs() <= GRID_TOLERANCE * a.abs().max(1.0);
        close(self.0[1], other.0[1])
            && close(self.0[2], other.0[2])
            && close(self.0[4], other.0[4])
            && close(self.0[5], other.0[5])
    }

    /// Pixel offset (rows, cols) of `other`'s origin on this grid.
    ///
    /// Both transforms must be north-up with identical pixel size, and the
    /// offset must be a whole number of pixels.
    pub fn pixel_offset_of(&self, other: &GeoTransform) -> Result<(i64, i64)> {
        if !self.is_north_up() || !other.is_north_up() {
            return Err(ClassifyError::Mosaic(
                "rotated geotransforms are not supported".to_string(),
            ));
        }
        if !self.same_grid_spacing(other) {
            return Err(ClassifyError::Mosaic(format!(
                "pixel size {:?} does not match {:?}",
                other.pixel_size(),
                self.pixel_size()
            )));
        }

        let col = (other.0[0] - self.0[0]) / self.0[1];
        let row = (other.0[3] - self.0[3]) / self.0[5];
        let (col_r, row_r) = (col.round(), row.round());
        if (col - col_r).abs() > GRID_TOLERANCE || (row - row_r).abs() > GRID_TOLERANCE {
            return Err(ClassifyError::Mosaic(format!(
                "origin ({}, {}) is not aligned to the pixel grid",
                other.0[0], other.0[3]
            )));
        }
        Ok((row_r as i64, col_r as i64))
    }
}

/// Raw GeoTIFF key directory and parameter tags, carried through untouched.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GeoKeys {
    pub directory: Vec<u16>,
    pub doubles: Option<Vec<f64>>,
    pub ascii: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct GeoReference {
    pub transform: GeoTransform,
    pub geokeys: Option<GeoKeys>,
}

impl GeoReference {
    pub fn new(transform: GeoTransform) -> Self {
        Self {
            transform,
            geokeys: None,
        }
    }

    pub fn for_window(&self, tile: &Tile) -> GeoReference {
        GeoReference {
            transform: self.transform.for_window(tile),
            geokeys: self.geokeys.clone(),
        }
    }

    /// Read the geotransform, CRS keys and nodata value from a TIFF header.
    pub fn read_tags<R: Read + Seek>(decoder: &mut Decoder<R>) -> Result<(GeoReference, Option<f64>)> {
        let transform = match read_f64s(decoder, MODEL_TRANSFORMATION)? {
            Some(m) if m.len() >= 16 => GeoTransform([m[3], m[0], m[1], m[7], m[4], m[5]]),
            _ => {
                let scale = read_f64s(decoder, MODEL_PIXEL_SCALE)?;
                let tiepoint = read_f64s(decoder, MODEL_TIEPOINT)?;
                match (scale, tiepoint) {
                    (Some(s), Some(t)) if s.len() >= 2 && t.len() >= 6 => {
                        if t.len() > 6 {
                            warn!("Multiple tie points found, using the first one");
                        }
                        GeoTransform([t[3] - t[0] * s[0], s[0], 0.0, t[4] + t[1] * s[1], 0.0, -s[1]])
                    }
                    _ => {
                        debug!("No georeferencing tags, using identity transform");
                        GeoTransform::default()
                    }
                }
            }
        };

        let geokeys = match decoder.find_tag(tag(GEO_KEY_DIRECTORY))? {
            Some(value) => Some(GeoKeys {
                directory: value.into_u16_vec()?,
                doubles: read_f64s(decoder, GEO_DOUBLE_PARAMS)?,
                ascii: decoder
                    .find_tag(tag(GEO_ASCII_PARAMS))?
                    .map(|v| v.into_string())
                    .transpose()?,
            }),
            None => None,
        };

        let nodata = decoder
            .find_tag(tag(GDAL_NODATA))?
            .map(|v| v.into_string())
            .transpose()?
            .and_then(|s| parse_nodata(&s));

        Ok((GeoReference { transform, geokeys }, nodata))
    }

    /// Write the georeferencing tags and the nodata value into an image directory.
    pub fn write_tags<W: Write + Seek, K: TiffKind>(
        &self,
        encoder: &mut DirectoryEncoder<'_, W, K>,
        nodata: Option<f64>,
    ) -> Result<()> {
        let g = &self.transform.0;
        if self.transform.is_north_up() {
            encoder.write_tag(tag(MODEL_PIXEL_SCALE), &[g[1], -g[5], 0.0][..])?;
            encoder.write_tag(tag(MODEL_TIEPOINT), &[0.0, 0.0, 0.0, g[0], g[3], 0.0][..])?;
        } else {
            let matrix = [
                g[1], g[2], 0.0, g[0], //
                g[4], g[5], 0.0, g[3], //
                0.0, 0.0, 0.0, 0.0, //
                0.0, 0.0, 0.0, 1.0,
            ];
            encoder.write_tag(tag(MODEL_TRANSFORMATION), &matrix[..])?;
        }

        if let Some(keys) = &self.geokeys {
            encoder.write_tag(tag(GEO_KEY_DIRECTORY), &keys.directory[..])?;
            if let Some(doubles) = &keys.doubles {
                encoder.write_tag(tag(GEO_DOUBLE_PARAMS), &doubles[..])?;
            }
            if let Some(ascii) = &keys.ascii {
                encoder.write_tag(tag(GEO_ASCII_PARAMS), ascii.as_str())?;
            }
        }

        if let Some(nd) = nodata {
            encoder.write_tag(tag(GDAL_NODATA), format_nodata(nd).as_str())?;
        }
        Ok(())
    }
}

fn read_f64s<R: Read + Seek>(decoder: &mut Decoder<R>, code: u16) -> Result<Option<Vec<f64>>> {
    Ok(decoder
        .find_tag(tag(code))?
        .map(|v| v.into_f64_vec())
        .transpose()?)
}

fn parse_nodata(s: &str) -> Option<f64> {
    let trimmed = s.trim_matches(char::from(0)).trim();
    match trimmed.to_ascii_lowercase().as_str() {
        "nan" => Some(f64::NAN),
        other => other.parse().ok(),
    }
}

fn format_nodata(value: f64) -> String {
    if value.is_nan() {
        "nan".to_string()
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn utm_like() -> GeoTransform {
        GeoTransform([500000.0, 30.0, 0.0, 4200000.0, 0.0, -30.0])
    }

    #[test]
    fn test_window_transform() {
        let gt = utm_like().for_window(&Tile::new(10, 20, 5, 5));
        assert_relative_eq!(gt.0[0], 500600.0);
        assert_relative_eq!(gt.0[3], 4199700.0);
        assert_eq!(gt.pixel_size(), (30.0, -30.0));
    }

    #[test]
    fn test_pixel_offset_round_trips_window() {
        let base = utm_like();
        let tile = Tile::new(2048, 1024, 10, 10);
        let offset = base.pixel_offset_of(&base.for_window(&tile)).unwrap();
        assert_eq!(offset, (2048, 1024));
    }

    #[test]
    fn test_pixel_offset_rejects_misaligned() {
        let base = utm_like();
        let mut shifted = base;
        shifted.0[0] += 7.5;
        assert!(base.pixel_offset_of(&shifted).is_err());

        let mut coarser = base;
        coarser.0[1] = 60.0;
        assert!(base.pixel_offset_of(&coarser).is_err());
    }

    #[test]
    fn test_parse_nodata() {
        assert_eq!(parse_nodata("-9999\0"), Some(-9999.0));
        assert!(parse_nodata("nan").unwrap().is_nan());
        assert_eq!(parse_nodata("garbage"), None);
        assert_eq!(format_nodata(0.0), "0");
    }
}
