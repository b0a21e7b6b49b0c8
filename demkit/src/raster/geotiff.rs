//! GeoTIFF rasters.
//!
//! Only band 1 is read. Georeferencing comes from the GeoTIFF model tags and
//! the GeoKey directory; the no-data value from the GDAL_NODATA tag.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::Path;

use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::tags::Tag;

use super::geo::{GeoTransform, SpatialRef};
use super::{LoadedRaster, RasterInfo, Samples};
use crate::error::Result;

const MODEL_PIXEL_SCALE: u16 = 33550;
const MODEL_TIEPOINT: u16 = 33922;
const MODEL_TRANSFORMATION: u16 = 34264;
const GEO_KEY_DIRECTORY: u16 = 34735;
const GDAL_NODATA: u16 = 42113;

const GT_RASTER_TYPE_KEY: u16 = 1025;
const GEOGRAPHIC_TYPE_KEY: u16 = 2048;
const PROJECTED_CS_TYPE_KEY: u16 = 3072;

const RASTER_PIXEL_IS_POINT: u16 = 2;
const USER_DEFINED: u16 = 32767;

/// Decode a GeoTIFF file completely.
pub(crate) fn load(path: &Path) -> Result<LoadedRaster> {
    let file = BufReader::new(File::open(path)?);
    let mut decoder = Decoder::new(file)?;

    // Elevation grids routinely exceed the default decoding limits
    let mut limits = Limits::default();
    limits.decoding_buffer_size = 1024 * 1024 * 1024;
    limits.intermediate_buffer_size = 1024 * 1024 * 1024;
    limits.ifd_value_size = 1024 * 1024 * 1024;
    decoder = decoder.with_limits(limits);

    let (width, height) = decoder.dimensions()?;
    let (width, height) = (width as usize, height as usize);

    let geo_keys = read_geo_keys(&mut decoder);
    let geo_transform = read_geo_transform(&mut decoder).map(|gt| {
        if geo_keys.get(&GT_RASTER_TYPE_KEY) == Some(&RASTER_PIXEL_IS_POINT) {
            shift_to_pixel_corner(gt)
        } else {
            gt
        }
    });
    let spatial_ref = spatial_ref_from_keys(&geo_keys);
    let no_data = read_no_data(&mut decoder);
    let samples = decode_first_band(&mut decoder, width * height)?;

    Ok(LoadedRaster {
        info: RasterInfo {
            width,
            height,
            geo_transform,
            spatial_ref,
            no_data,
        },
        samples: Samples::Decoded(samples),
    })
}

fn tag(code: u16) -> Tag {
    Tag::from_u16_exhaustive(code)
}

fn read_geo_transform<R: Read + Seek>(decoder: &mut Decoder<R>) -> Option<GeoTransform> {
    if let Ok(m) = decoder.get_tag_f64_vec(tag(MODEL_TRANSFORMATION)) {
        if m.len() >= 16 {
            return Some(GeoTransform([m[3], m[0], m[1], m[7], m[4], m[5]]));
        }
    }

    let tiepoint = decoder.get_tag_f64_vec(tag(MODEL_TIEPOINT)).ok()?;
    let scale = decoder.get_tag_f64_vec(tag(MODEL_PIXEL_SCALE)).ok()?;
    if tiepoint.len() < 6 || scale.len() < 2 {
        return None;
    }

    // Tiepoint (i, j, k, x, y, z) pins raster position (i, j) to (x, y)
    let (i, j, x, y) = (tiepoint[0], tiepoint[1], tiepoint[3], tiepoint[4]);
    Some(GeoTransform([
        x - i * scale[0],
        scale[0],
        0.0,
        y + j * scale[1],
        0.0,
        -scale[1],
    ]))
}

fn shift_to_pixel_corner(gt: GeoTransform) -> GeoTransform {
    let mut coefficients = gt.0;
    coefficients[0] -= 0.5 * (coefficients[1] + coefficients[2]);
    coefficients[3] -= 0.5 * (coefficients[4] + coefficients[5]);
    GeoTransform(coefficients)
}

/// Inline-valued keys of the GeoKey directory.
fn read_geo_keys<R: Read + Seek>(decoder: &mut Decoder<R>) -> HashMap<u16, u16> {
    let Ok(directory) = decoder.get_tag_u16_vec(tag(GEO_KEY_DIRECTORY)) else {
        return HashMap::new();
    };
    // Header: version, revision, minor revision, key count
    let Some(&count) = directory.get(3) else {
        return HashMap::new();
    };

    directory[4..]
        .chunks_exact(4)
        .take(usize::from(count))
        // Entries with a tag location point into other tags; only codes matter here
        .filter(|entry| entry[1] == 0)
        .map(|entry| (entry[0], entry[3]))
        .collect()
}

fn spatial_ref_from_keys(keys: &HashMap<u16, u16>) -> Option<SpatialRef> {
    [PROJECTED_CS_TYPE_KEY, GEOGRAPHIC_TYPE_KEY]
        .iter()
        .filter_map(|key| keys.get(key))
        .find(|&&code| code != 0 && code != USER_DEFINED)
        .map(|&code| SpatialRef::Epsg(code))
}

fn read_no_data<R: Read + Seek>(decoder: &mut Decoder<R>) -> Option<f64> {
    let text = decoder.get_tag_ascii_string(tag(GDAL_NODATA)).ok()?;
    text.trim_matches(|c: char| c.is_whitespace() || c == '\0')
        .parse()
        .ok()
}

fn decode_first_band<R: Read + Seek>(decoder: &mut Decoder<R>, pixels: usize) -> Result<Vec<f64>> {
    let samples: Vec<f64> = match decoder.read_image()? {
        DecodingResult::U8(data) => data.into_iter().map(f64::from).collect(),
        DecodingResult::U16(data) => data.into_iter().map(f64::from).collect(),
        DecodingResult::U32(data) => data.into_iter().map(f64::from).collect(),
        DecodingResult::U64(data) => data.into_iter().map(|v| v as f64).collect(),
        DecodingResult::I8(data) => data.into_iter().map(f64::from).collect(),
        DecodingResult::I16(data) => data.into_iter().map(f64::from).collect(),
        DecodingResult::I32(data) => data.into_iter().map(f64::from).collect(),
        DecodingResult::I64(data) => data.into_iter().map(|v| v as f64).collect(),
        DecodingResult::F32(data) => data.into_iter().map(f64::from).collect(),
        DecodingResult::F64(data) => data,
    };

    // Pixel-interleaved bands: keep the first sample of every pixel
    let bands = if pixels == 0 { 1 } else { (samples.len() / pixels).max(1) };
    if bands == 1 {
        return Ok(samples);
    }
    Ok(samples.into_iter().step_by(bands).take(pixels).collect())
}
