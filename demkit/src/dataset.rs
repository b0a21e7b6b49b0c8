//! An open raster prepared for point queries in WGS84.

use std::path::Path;

use crate::error::{DemError, Result};
use crate::raster::{CoordinateTransform, GeoTransform, RasterDriver, RasterHandle, SpatialRef};

/// An open, georeferenced raster together with everything a point query
/// needs: the geotransform, the WGS84-to-raster transformation (when the
/// raster is not already in WGS84) and the no-data sentinel.
///
/// A `DatasetCache` always wraps a usable raster; "no dataset" is modelled as
/// `Option<DatasetCache>` by its owners. Dropping it closes the raster.
#[derive(Debug)]
pub struct DatasetCache {
    handle: RasterHandle,
    geo_transform: GeoTransform,
    transform: Option<CoordinateTransform>,
}

impl DatasetCache {
    /// Open `path` through `driver`.
    ///
    /// # Errors
    ///
    /// Returns an error if the raster cannot be opened, has no geotransform,
    /// or declares a spatial reference the projection library cannot build a
    /// transformation for.
    pub fn open(driver: &RasterDriver, path: impl AsRef<Path>) -> Result<Self> {
        Self::from_handle(driver.open(path)?)
    }

    /// Wrap an already open raster.
    pub fn from_handle(handle: RasterHandle) -> Result<Self> {
        let geo_transform = handle
            .info()
            .geo_transform
            .ok_or_else(|| DemError::MissingGeoTransform {
                path: handle.path().to_path_buf(),
            })?;

        // Rasters without a spatial reference are queried in their own units
        let transform = match &handle.info().spatial_ref {
            Some(srs) if !srs.is_wgs84() => CoordinateTransform::new(&SpatialRef::wgs84(), srs)?,
            _ => None,
        };

        Ok(Self {
            handle,
            geo_transform,
            transform,
        })
    }

    /// Path of the underlying raster.
    pub fn path(&self) -> &Path {
        self.handle.path()
    }

    /// Raster size as `(width, height)`.
    pub fn size(&self) -> (usize, usize) {
        self.handle.size()
    }

    /// Spatial reference of the raster.
    pub fn spatial_ref(&self) -> Option<&SpatialRef> {
        self.handle.info().spatial_ref.as_ref()
    }

    /// The raster's affine geotransform.
    pub fn geo_transform(&self) -> &GeoTransform {
        &self.geo_transform
    }

    /// True when `value` is the raster's no-data sentinel.
    pub fn is_no_data(&self, value: f64) -> bool {
        self.handle.info().is_no_data(value)
    }

    /// True when queries are reprojected before sampling.
    pub fn has_transform(&self) -> bool {
        self.transform.is_some()
    }

    /// Convert a WGS84 `(lon, lat)` into the raster's spatial reference.
    /// Identity when no transformation is needed.
    pub fn convert(&self, lon: f64, lat: f64) -> Result<(f64, f64)> {
        match &self.transform {
            Some(transform) => transform.transform(lon, lat),
            None => Ok((lon, lat)),
        }
    }

    /// Continuous pixel coordinate of a position in the raster's reference,
    /// integral at pixel centres.
    pub fn to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        self.geo_transform.geo_to_pixel_center(x, y)
    }

    /// Read a row-major window of band 1.
    pub fn read_window(&mut self, x: usize, y: usize, width: usize, height: usize) -> Result<Vec<f64>> {
        self.handle.read_block(x, y, width, height)
    }
}
