//! Georeferencing primitives: affine geotransforms, spatial references and
//! coordinate transformations between them.

use std::fmt;

use proj4rs::Proj;
use serde::{Deserialize, Serialize};

use crate::error::{DemError, Result};

/// EPSG code of WGS84 geographic coordinates, the query reference system.
pub const WGS84_EPSG: u16 = 4326;

/// Six-coefficient affine geotransform, GDAL ordering.
///
/// A geographic position of pixel corner `(col, row)` is
/// `X = gt[0] + col*gt[1] + row*gt[2]`, `Y = gt[3] + col*gt[4] + row*gt[5]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform(pub [f64; 6]);

impl GeoTransform {
    /// Geographic position of the upper-left corner of the raster.
    pub fn origin(&self) -> (f64, f64) {
        (self.0[0], self.0[3])
    }

    /// Pixel width and height (height is negative for north-up rasters).
    pub fn pixel_size(&self) -> (f64, f64) {
        (self.0[1], self.0[5])
    }

    /// True when the rotation terms are zero.
    pub fn is_axis_aligned(&self) -> bool {
        self.0[2] == 0.0 && self.0[4] == 0.0
    }

    /// Geographic position of a pixel-corner coordinate.
    pub fn pixel_to_geo(&self, col: f64, row: f64) -> (f64, f64) {
        let gt = &self.0;
        (
            gt[0] + col * gt[1] + row * gt[2],
            gt[3] + col * gt[4] + row * gt[5],
        )
    }

    /// Inverse of [`pixel_to_geo`](Self::pixel_to_geo).
    ///
    /// A degenerate (non-invertible) transform yields NaN coordinates, which
    /// every bounds check downstream rejects.
    pub fn geo_to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        let gt = &self.0;
        let dx = x - gt[0];
        let dy = y - gt[3];
        if self.is_axis_aligned() {
            return (dx / gt[1], dy / gt[5]);
        }
        let det = gt[1] * gt[5] - gt[2] * gt[4];
        if det == 0.0 {
            return (f64::NAN, f64::NAN);
        }
        (
            (gt[5] * dx - gt[2] * dy) / det,
            (gt[1] * dy - gt[4] * dx) / det,
        )
    }

    /// Continuous pixel coordinate of a geographic position, where integral
    /// values fall on pixel centres.
    ///
    /// This is the convention bilinear interpolation works in: the four
    /// neighbours of `(x, y)` are at `floor(x)`, `floor(x) + 1` (same for `y`).
    pub fn geo_to_pixel_center(&self, x: f64, y: f64) -> (f64, f64) {
        let (col, row) = self.geo_to_pixel(x, y);
        (col - 0.5, row - 0.5)
    }
}

/// Spatial reference of a raster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpatialRef {
    /// An EPSG code.
    Epsg(u16),
    /// A PROJ.4 definition string.
    Proj4(String),
}

impl SpatialRef {
    /// WGS84 geographic coordinates.
    pub fn wgs84() -> Self {
        SpatialRef::Epsg(WGS84_EPSG)
    }

    /// True for WGS84 longitude/latitude in degrees.
    pub fn is_wgs84(&self) -> bool {
        match self {
            SpatialRef::Epsg(code) => *code == WGS84_EPSG,
            SpatialRef::Proj4(definition) => {
                let mut tokens: Vec<&str> = definition
                    .split_whitespace()
                    .filter(|t| *t != "+no_defs" && *t != "+type=crs")
                    .collect();
                tokens.sort_unstable();
                tokens == ["+datum=WGS84", "+proj=longlat"]
                    || tokens == ["+ellps=WGS84", "+proj=longlat"]
                    || tokens == ["+datum=WGS84", "+ellps=WGS84", "+proj=longlat"]
            }
        }
    }

    /// True when both references describe the same system.
    pub fn is_same(&self, other: &SpatialRef) -> bool {
        self == other || (self.is_wgs84() && other.is_wgs84())
    }

    fn to_proj(&self) -> Result<Proj> {
        match self {
            SpatialRef::Epsg(code) => Proj::from_epsg_code(*code)
                .map_err(|e| DemError::Projection(format!("EPSG:{code}: {e:?}"))),
            SpatialRef::Proj4(definition) => Proj::from_proj_string(definition)
                .map_err(|e| DemError::Projection(format!("{definition}: {e:?}"))),
        }
    }
}

impl fmt::Display for SpatialRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpatialRef::Epsg(code) => write!(f, "EPSG:{code}"),
            SpatialRef::Proj4(definition) => f.write_str(definition),
        }
    }
}

/// A point transformation from one spatial reference into another.
pub struct CoordinateTransform {
    source: Proj,
    target: Proj,
    source_ref: SpatialRef,
    target_ref: SpatialRef,
}

impl CoordinateTransform {
    /// Build a transformation from `source` into `target`.
    ///
    /// Returns `Ok(None)` when both references are the same system and no
    /// transformation is needed.
    ///
    /// # Errors
    ///
    /// Returns [`DemError::Projection`] if either reference is unknown to the
    /// projection library.
    pub fn new(source: &SpatialRef, target: &SpatialRef) -> Result<Option<Self>> {
        if source.is_same(target) {
            return Ok(None);
        }
        Ok(Some(Self {
            source: source.to_proj()?,
            target: target.to_proj()?,
            source_ref: source.clone(),
            target_ref: target.clone(),
        }))
    }

    /// Transform one point. Geographic coordinates are in degrees on both
    /// sides; projected ones in the units of their definition.
    pub fn transform(&self, x: f64, y: f64) -> Result<(f64, f64)> {
        let mut point = (x, y, 0.0);
        if self.source.is_latlong() {
            point.0 = point.0.to_radians();
            point.1 = point.1.to_radians();
        }

        proj4rs::transform::transform(&self.source, &self.target, &mut point)
            .map_err(|e| DemError::Projection(format!("{e:?}")))?;

        if self.target.is_latlong() {
            point.0 = point.0.to_degrees();
            point.1 = point.1.to_degrees();
        }
        Ok((point.0, point.1))
    }
}

impl fmt::Debug for CoordinateTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoordinateTransform")
            .field("source", &self.source_ref)
            .field("target", &self.target_ref)
            .finish()
    }
}
