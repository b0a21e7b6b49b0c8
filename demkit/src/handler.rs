//! Per-worker elevation handler.
//!
//! A [`DemHandler`] owns its own open datasets and read windows, so it is
//! never shared: a thread holds one handler at a time, checked out of the
//! registry's pool. Registry changes reach the handler as a new
//! [`HandlerConfig`] through [`DemHandler::apply`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::dataset::DatasetCache;
use crate::elevation_cache::ElevationCache;
use crate::raster::RasterDriver;

/// The elevation raster a handler queries, identified by path and by the
/// generation of the mosaic written there.
#[derive(Debug, Clone, PartialEq)]
pub struct ElevationSource {
    pub path: PathBuf,
    pub generation: u64,
}

/// What a handler should have open.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandlerConfig {
    /// DEM mosaic.
    pub elevation: Option<ElevationSource>,
    /// Geoid raster.
    pub geoid: Option<PathBuf>,
}

/// Bilinear sample of a dataset at a WGS84 point through its read window.
///
/// `None` when the point cannot be converted, falls outside the raster or
/// within one pixel of its far edge, or touches a no-data sample.
pub(crate) fn sample(
    dataset: &mut DatasetCache,
    window: &mut ElevationCache,
    lon: f64,
    lat: f64,
) -> Option<f64> {
    let (x, y) = dataset.convert(lon, lat).ok()?;
    let (x, y) = dataset.to_pixel(x, y);
    let (width, height) = dataset.size();

    if !x.is_finite() || !y.is_finite() {
        return None;
    }
    if x < 0.0 || y < 0.0 || x + 1.0 >= width as f64 || y + 1.0 >= height as f64 {
        return None;
    }

    let (col, row) = (x.floor() as usize, y.floor() as usize);
    if !window.holds(col, row) && !window.fill(dataset, col, row) {
        return None;
    }

    let v = window.sample4(col, row);
    if v.iter().any(|&s| dataset.is_no_data(s)) {
        return None;
    }
    Some(crate::raster::bilinear(v, x - col as f64, y - row as f64))
}

fn open_layer(driver: &RasterDriver, path: &Path, layer: &str) -> Option<DatasetCache> {
    match DatasetCache::open(driver, path) {
        Ok(dataset) => Some(dataset),
        Err(e) => {
            tracing::warn!(path = %path.display(), layer, error = %e, "Handler cannot open raster");
            None
        }
    }
}

/// One worker's view of the configured DEM and geoid.
pub struct DemHandler {
    driver: Arc<RasterDriver>,
    config: HandlerConfig,
    dem: Option<DatasetCache>,
    dem_window: ElevationCache,
    geoid: Option<DatasetCache>,
    geoid_window: ElevationCache,
}

impl DemHandler {
    /// Create a handler with nothing open.
    pub fn new(driver: Arc<RasterDriver>, window_size: usize) -> Self {
        Self {
            driver,
            config: HandlerConfig::default(),
            dem: None,
            dem_window: ElevationCache::new(window_size),
            geoid: None,
            geoid_window: ElevationCache::new(window_size),
        }
    }

    /// The configuration currently applied.
    pub fn config(&self) -> &HandlerConfig {
        &self.config
    }

    /// Bring the open datasets in line with `config`, reopening only the
    /// layers that changed.
    pub fn apply(&mut self, config: &HandlerConfig) {
        if self.config.elevation != config.elevation {
            self.dem_window.invalidate();
            self.dem = config
                .elevation
                .as_ref()
                .and_then(|source| open_layer(&self.driver, &source.path, "dem"));
        }
        if self.config.geoid != config.geoid {
            self.geoid_window.invalidate();
            self.geoid = config
                .geoid
                .as_deref()
                .and_then(|path| open_layer(&self.driver, path, "geoid"));
        }
        self.config = config.clone();
    }

    /// Close every dataset.
    pub fn clear(&mut self) {
        self.apply(&HandlerConfig::default());
    }

    /// Height above mean sea level, if the DEM has data at the point.
    pub fn height_above_msl(&mut self, lon: f64, lat: f64) -> Option<f64> {
        let dem = self.dem.as_mut()?;
        sample(dem, &mut self.dem_window, lon, lat)
    }

    /// Geoid undulation, if the geoid has data at the point.
    pub fn geoid_height(&mut self, lon: f64, lat: f64) -> Option<f64> {
        let geoid = self.geoid.as_mut()?;
        sample(geoid, &mut self.geoid_window, lon, lat)
    }

    /// Height above the WGS84 ellipsoid.
    ///
    /// Whatever is available is summed: DEM + geoid, the DEM alone, or the
    /// geoid alone. Only when neither has data is `default_height` returned.
    pub fn height_above_ellipsoid(&mut self, lon: f64, lat: f64, default_height: f64) -> f64 {
        let dem = self.height_above_msl(lon, lat);
        let geoid = self.geoid_height(lon, lat);
        match (dem, geoid) {
            (None, None) => default_height,
            (dem, geoid) => dem.unwrap_or(0.0) + geoid.unwrap_or(0.0),
        }
    }
}
