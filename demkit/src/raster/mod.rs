//! Raster access: opening elevation files, reading sample blocks, and
//! building the virtual rasters (mosaics, geoid composites) the registry
//! queries through.
//!
//! [`RasterDriver`] is the entry point. It opens a path into a
//! [`RasterHandle`], dispatching on the extension:
//!
//! | Extension | Format |
//! |-----------|--------|
//! | `.hgt` | SRTM tile, memory-mapped |
//! | `.hgt.zip` | zipped SRTM tile |
//! | `.tif`, `.tiff` | GeoTIFF, band 1 |
//! | `.json` | mosaic or sum composite written by this driver |
//!
//! Decoded file rasters live only in the driver's bounded cache. A file
//! handle keeps its metadata and fetches samples through the cache on each
//! read, so memory stays bounded by the cache capacity however many handles,
//! mosaics and workers refer to the same files.

use std::cell::Cell;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use moka::sync::Cache;

use crate::error::{DemError, Result};

mod composite;
pub mod geo;
pub mod geotiff;
pub mod hgt;

pub use geo::{CoordinateTransform, GeoTransform, SpatialRef, WGS84_EPSG};
pub use hgt::{SrtmResolution, VOID_VALUE};

use composite::{MosaicRaster, SumRaster};

/// Default number of decoded rasters kept in the shared cache.
pub const DEFAULT_CACHE_SIZE: u64 = 100;

/// Metadata of a raster's first band.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterInfo {
    /// Width in pixels.
    pub width: usize,
    /// Height in pixels.
    pub height: usize,
    /// Affine pixel-to-geographic transform, if georeferenced.
    pub geo_transform: Option<GeoTransform>,
    /// Spatial reference, if declared.
    pub spatial_ref: Option<SpatialRef>,
    /// Sentinel marking missing samples, if declared.
    pub no_data: Option<f64>,
}

impl RasterInfo {
    /// True when `value` is the no-data sentinel (NaN sentinels match NaN).
    pub fn is_no_data(&self, value: f64) -> bool {
        match self.no_data {
            Some(nd) if nd.is_nan() => value.is_nan(),
            Some(nd) => value == nd,
            None => false,
        }
    }
}

/// Statistics about the shared raster cache.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Number of decoded rasters currently in the cache.
    pub entry_count: u64,
    /// Number of opens served from the cache.
    pub hit_count: u64,
    /// Number of opens that decoded from disk.
    pub miss_count: u64,
}

impl CacheStats {
    /// Calculate the cache hit rate (0.0 to 1.0).
    ///
    /// Returns 0.0 if no requests have been made.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hit_count + self.miss_count;
        if total == 0 {
            0.0
        } else {
            self.hit_count as f64 / total as f64
        }
    }
}

/// Sample storage of a decoded file raster.
pub(crate) enum Samples {
    Hgt(hgt::HgtBytes),
    Decoded(Vec<f64>),
}

/// A file raster fully available in memory (or mapped).
pub(crate) struct LoadedRaster {
    pub(crate) info: RasterInfo,
    pub(crate) samples: Samples,
}

impl LoadedRaster {
    /// Row-major block read. The window must already be validated.
    pub(crate) fn read(&self, x: usize, y: usize, width: usize, height: usize) -> Vec<f64> {
        let stride = self.info.width;
        let mut out = Vec::with_capacity(width * height);
        for row in y..y + height {
            let start = row * stride + x;
            match &self.samples {
                Samples::Hgt(bytes) => bytes.read_row(start, width, &mut out),
                Samples::Decoded(values) => out.extend_from_slice(&values[start..start + width]),
            }
        }
        out
    }
}

type Loader = fn(&Path) -> Result<LoadedRaster>;

/// Decoded file rasters shared by every handle of one driver.
struct RasterStore {
    rasters: Cache<PathBuf, Arc<LoadedRaster>>,
    hit_count: AtomicU64,
    miss_count: AtomicU64,
}

impl RasterStore {
    fn fetch(&self, path: &Path, loader: Loader) -> Result<Arc<LoadedRaster>> {
        if let Some(raster) = self.rasters.get(path) {
            self.hit_count.fetch_add(1, Ordering::Relaxed);
            return Ok(raster);
        }
        self.miss_count.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(path = %path.display(), "Decoding raster");
        let raster = Arc::new(loader(path)?);
        self.rasters.insert(path.to_path_buf(), Arc::clone(&raster));
        Ok(raster)
    }
}

/// A file raster read through the store.
struct FileSource {
    store: Arc<RasterStore>,
    loader: Loader,
}

impl FileSource {
    fn read(&self, path: &Path, info: &RasterInfo, x: usize, y: usize, width: usize, height: usize) -> Result<Vec<f64>> {
        let raster = self.store.fetch(path, self.loader)?;
        if (raster.info.width, raster.info.height) != (info.width, info.height) {
            return Err(DemError::IncompatibleSources {
                reason: format!("{} changed size since it was opened", path.display()),
            });
        }
        Ok(raster.read(x, y, width, height))
    }
}

enum Source {
    File(FileSource),
    Mosaic(MosaicRaster),
    Sum(Box<SumRaster>),
}

/// An open raster.
///
/// Handles are `Send` but not `Sync`: a handle may move between threads, but
/// reads through it are never concurrent.
pub struct RasterHandle {
    path: PathBuf,
    info: RasterInfo,
    source: Source,
    _not_sync: PhantomData<Cell<()>>,
}

impl RasterHandle {
    fn new(path: &Path, info: RasterInfo, source: Source) -> Self {
        Self {
            path: path.to_path_buf(),
            info,
            source,
            _not_sync: PhantomData,
        }
    }

    /// Path the handle was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Metadata of band 1.
    pub fn info(&self) -> &RasterInfo {
        &self.info
    }

    /// Raster size as `(width, height)`.
    pub fn size(&self) -> (usize, usize) {
        (self.info.width, self.info.height)
    }

    /// Read a `width` × `height` block of band 1 at pixel `(x, y)`, row-major.
    ///
    /// # Errors
    ///
    /// Returns [`DemError::WindowOutOfBounds`] if the block is empty or not
    /// entirely inside the raster, or any error from the underlying sources
    /// of a virtual raster.
    pub fn read_block(&mut self, x: usize, y: usize, width: usize, height: usize) -> Result<Vec<f64>> {
        check_window(&self.info, x, y, width, height)?;
        match &mut self.source {
            Source::File(file) => file.read(&self.path, &self.info, x, y, width, height),
            Source::Mosaic(mosaic) => mosaic.read(&self.info, x, y, width, height),
            Source::Sum(sum) => sum.read(&self.info, x, y, width, height),
        }
    }
}

impl std::fmt::Debug for RasterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.source {
            Source::File(_) => "file",
            Source::Mosaic(_) => "mosaic",
            Source::Sum(_) => "sum",
        };
        f.debug_struct("RasterHandle")
            .field("path", &self.path)
            .field("kind", &kind)
            .field("info", &self.info)
            .finish()
    }
}

fn check_window(info: &RasterInfo, x: usize, y: usize, width: usize, height: usize) -> Result<()> {
    let fits = |start: usize, len: usize, limit: usize| {
        len > 0 && start.checked_add(len).is_some_and(|end| end <= limit)
    };
    if fits(x, width, info.width) && fits(y, height, info.height) {
        Ok(())
    } else {
        Err(DemError::WindowOutOfBounds {
            x,
            y,
            width,
            height,
            raster_width: info.width,
            raster_height: info.height,
        })
    }
}

/// Bilinear blend of the 2×2 neighbourhood `[v00, v10, v01, v11]`
/// (row-major: top-left, top-right, bottom-left, bottom-right).
pub fn bilinear(v: [f64; 4], dx: f64, dy: f64) -> f64 {
    let top = v[0] * (1.0 - dx) + v[1] * dx;
    let bottom = v[2] * (1.0 - dx) + v[3] * dx;
    top * (1.0 - dy) + bottom * dy
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RasterFormat {
    Hgt,
    HgtZip,
    GeoTiff,
    Descriptor,
}

impl RasterFormat {
    fn loader(self) -> Option<Loader> {
        match self {
            RasterFormat::Hgt => Some(hgt::load as Loader),
            RasterFormat::HgtZip => Some(hgt::load_zip as Loader),
            RasterFormat::GeoTiff => Some(geotiff::load as Loader),
            RasterFormat::Descriptor => None,
        }
    }

    fn detect(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_ascii_lowercase();
        if name.ends_with(".hgt") {
            Some(RasterFormat::Hgt)
        } else if name.ends_with(".hgt.zip") {
            Some(RasterFormat::HgtZip)
        } else if name.ends_with(".tif") || name.ends_with(".tiff") {
            Some(RasterFormat::GeoTiff)
        } else if name.ends_with(".json") {
            Some(RasterFormat::Descriptor)
        } else {
            None
        }
    }
}

/// True when `path` has the extension of a format the driver can open.
pub fn is_raster_path(path: &Path) -> bool {
    RasterFormat::detect(path).is_some()
}

/// Opens rasters and writes virtual rasters.
///
/// The driver is shared by the registry and every handler; all methods take
/// `&self`.
pub struct RasterDriver {
    store: Arc<RasterStore>,
}

impl RasterDriver {
    /// Create a driver caching up to `cache_size` decoded rasters.
    pub fn new(cache_size: u64) -> Self {
        Self {
            store: Arc::new(RasterStore {
                rasters: Cache::builder().max_capacity(cache_size).build(),
                hit_count: AtomicU64::new(0),
                miss_count: AtomicU64::new(0),
            }),
        }
    }

    /// Open a raster.
    ///
    /// # Errors
    ///
    /// Returns [`DemError::UnsupportedFormat`] for unknown extensions, or the
    /// decoding error of the file (or of any source of a virtual raster).
    pub fn open(&self, path: impl AsRef<Path>) -> Result<RasterHandle> {
        let path = path.as_ref();
        let format = RasterFormat::detect(path).ok_or_else(|| DemError::UnsupportedFormat {
            path: path.to_path_buf(),
        })?;

        if let Some(loader) = format.loader() {
            let info = self.store.fetch(path, loader)?.info.clone();
            return Ok(self.file_handle(path, info, loader));
        }
        match composite::read_descriptor(path)? {
            composite::Descriptor::Mosaic(descriptor) => {
                let (info, mosaic) = MosaicRaster::open(self, descriptor)?;
                Ok(RasterHandle::new(path, info, Source::Mosaic(mosaic)))
            }
            composite::Descriptor::Sum(descriptor) => {
                let (info, sum) = SumRaster::open(self, descriptor)?;
                Ok(RasterHandle::new(path, info, Source::Sum(Box::new(sum))))
            }
        }
    }

    /// Open a file raster whose metadata is already known, without decoding
    /// it. Virtual rasters are opened normally.
    pub(crate) fn open_with_info(&self, path: &Path, info: RasterInfo) -> Result<RasterHandle> {
        match RasterFormat::detect(path).and_then(RasterFormat::loader) {
            Some(loader) => Ok(self.file_handle(path, info, loader)),
            None => self.open(path),
        }
    }

    fn file_handle(&self, path: &Path, info: RasterInfo, loader: Loader) -> RasterHandle {
        let source = FileSource {
            store: Arc::clone(&self.store),
            loader,
        };
        RasterHandle::new(path, info, Source::File(source))
    }

    /// Write a mosaic descriptor at `dest` combining `sources` on one grid.
    ///
    /// Later sources paint over earlier ones wherever they hold data.
    ///
    /// # Errors
    ///
    /// Fails if `sources` is empty, a source is not georeferenced or is
    /// rotated, or the sources disagree on pixel size or spatial reference.
    pub fn build_mosaic(&self, sources: &[&RasterHandle], dest: &Path) -> Result<()> {
        composite::write_mosaic(sources, dest)
    }

    /// Write a sum composite descriptor at `dest`: `base` plus `addend`
    /// resampled bilinearly onto the grid of `base`.
    ///
    /// # Errors
    ///
    /// Fails if either input is not georeferenced or no transformation
    /// exists between their spatial references.
    pub fn build_sum_composite(&self, base: &RasterHandle, addend: &RasterHandle, dest: &Path) -> Result<()> {
        composite::write_sum(base, addend, dest)
    }

    /// Get cache statistics.
    pub fn cache_stats(&self) -> CacheStats {
        CacheStats {
            entry_count: self.store.rasters.entry_count(),
            hit_count: self.store.hit_count.load(Ordering::Relaxed),
            miss_count: self.store.miss_count.load(Ordering::Relaxed),
        }
    }

    /// Drop every decoded raster from the cache. Open handles decode again
    /// on their next read.
    pub fn clear_cache(&self) {
        self.store.rasters.invalidate_all();
    }
}

impl Default for RasterDriver {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_SIZE)
    }
}
