//! The elevation registry: configuration, handler pool and query facade.
//!
//! A [`Registry`] holds the authoritative configuration (DEM sources, the
//! directories they came from, the geoid file, the default height, observers)
//! behind one mutex, plus a pool of per-worker handlers. Configuration
//! changes take the mutex for their whole duration, including the mosaic
//! rebuild; queries never take it except to pick up a changed configuration.
//!
//! Queries can go through an explicit [`ElevationWorker`] obtained from
//! [`Registry::acquire`], or through the `get_*` methods, which keep one
//! worker per thread and return it to the pool when the thread exits (or on
//! [`Registry::release_current_thread`]).

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tempfile::TempDir;
use walkdir::WalkDir;

use crate::config::RegistryBuilder;
use crate::dataset::DatasetCache;
use crate::error::{DemError, Result};
use crate::handler::{DemHandler, ElevationSource, HandlerConfig};
use crate::pool::{ElevationWorker, HandlerSlot};
use crate::raster::{is_raster_path, CacheStats, RasterDriver, RasterHandle};

const MOSAIC_FILE: &str = "dem_mosaic.json";
const MOSAIC_PENDING_FILE: &str = "dem_mosaic.pending.json";
const SHIFTED_FILE: &str = "dem_shifted.json";

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static WORKERS: RefCell<Vec<ElevationWorker>> = const { RefCell::new(Vec::new()) };
}

/// Callback run after every successful configuration change.
pub type Observer = Arc<dyn Fn() + Send + Sync>;

/// Every file under `path`, recursively, in a stable order. A path naming a
/// file yields that file; a missing path yields nothing.
pub fn dem_files_in(path: impl AsRef<Path>) -> Vec<PathBuf> {
    WalkDir::new(path)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .collect()
}

/// A geoid must be georeferenced and declare its spatial reference.
fn check_geoid(driver: &RasterDriver, path: &Path) -> Result<()> {
    let geoid = DatasetCache::open(driver, path)?;
    if geoid.spatial_ref().is_none() {
        return Err(DemError::MissingSpatialReference {
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

/// DEM geoid-shifted composite and the inputs it was built from.
struct Composite {
    mosaic_generation: u64,
    geoid: PathBuf,
    path: PathBuf,
}

pub(crate) struct RegistryState {
    /// Metadata-only handles; decoded samples stay in the driver cache.
    sources: Vec<RasterHandle>,
    directories: Vec<PathBuf>,
    geoid: Option<PathBuf>,
    mosaic: Option<ElevationSource>,
    composite: Option<Composite>,
    generation: u64,
    pool: Vec<Arc<HandlerSlot>>,
    observers: Vec<Observer>,
    workdir: Option<TempDir>,
}

impl RegistryState {
    pub(crate) fn handler_config(&self) -> HandlerConfig {
        HandlerConfig {
            elevation: self.mosaic.clone(),
            geoid: self.geoid.clone(),
        }
    }

    fn mark_handlers_stale(&self) {
        for slot in &self.pool {
            slot.mark_stale();
        }
    }

    fn workdir(&self) -> Result<&Path> {
        self.workdir.as_ref().map(TempDir::path).ok_or(DemError::Closed)
    }

    /// Rebuild the mosaic from the full source list. The previous mosaic is
    /// replaced only once the new one has been built and opened.
    fn rebuild_mosaic(&mut self, driver: &RasterDriver) -> Result<()> {
        let workdir = self.workdir()?.to_path_buf();
        let pending = workdir.join(MOSAIC_PENDING_FILE);

        let handles: Vec<&RasterHandle> = self.sources.iter().collect();
        let built = driver
            .build_mosaic(&handles, &pending)
            .and_then(|()| DatasetCache::open(driver, &pending).map(drop));
        if let Err(e) = built {
            let _ = std::fs::remove_file(&pending);
            return Err(e);
        }

        let path = workdir.join(MOSAIC_FILE);
        std::fs::rename(&pending, &path)?;
        self.generation += 1;
        self.mosaic = Some(ElevationSource {
            path,
            generation: self.generation,
        });
        self.mark_handlers_stale();
        Ok(())
    }

    fn drop_mosaic(&mut self) {
        if let Some(mosaic) = self.mosaic.take() {
            let _ = std::fs::remove_file(&mosaic.path);
        }
        self.drop_composite();
        self.mark_handlers_stale();
    }

    fn drop_composite(&mut self) {
        if let Some(composite) = self.composite.take() {
            let _ = std::fs::remove_file(&composite.path);
        }
    }

    /// Build the geoid-shifted DEM when both inputs exist and it is not
    /// already built from exactly these inputs.
    fn ensure_composite(&mut self, driver: &RasterDriver) {
        let (mosaic_path, mosaic_generation, geoid) = match (&self.mosaic, &self.geoid) {
            (Some(mosaic), Some(geoid)) => (mosaic.path.clone(), mosaic.generation, geoid.clone()),
            _ => return,
        };
        if self
            .composite
            .as_ref()
            .is_some_and(|c| c.mosaic_generation == mosaic_generation && c.geoid == geoid)
        {
            return;
        }
        let Ok(workdir) = self.workdir() else {
            return;
        };

        let path = workdir.join(SHIFTED_FILE);
        let built = driver.open(&mosaic_path).and_then(|dem| {
            let geoid = driver.open(&geoid)?;
            driver.build_sum_composite(&dem, &geoid, &path)
        });
        match built {
            Ok(()) => {
                tracing::debug!(path = %path.display(), "Built geoid-shifted DEM");
                self.composite = Some(Composite {
                    mosaic_generation,
                    geoid,
                    path,
                });
            }
            Err(e) => {
                tracing::warn!(geoid = %geoid.display(), error = %e, "Cannot build geoid-shifted DEM");
                self.drop_composite();
            }
        }
    }

    fn clear(&mut self) {
        self.sources.clear();
        self.directories.clear();
        self.geoid = None;
        self.drop_mosaic();
        for slot in &self.pool {
            slot.with_parked(DemHandler::clear);
        }
    }
}

pub(crate) struct Shared {
    id: u64,
    driver: Arc<RasterDriver>,
    window_size: usize,
    default_height: AtomicU64,
    closed: AtomicBool,
    state: Mutex<RegistryState>,
}

impl Shared {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn default_height(&self) -> f64 {
        f64::from_bits(self.default_height.load(Ordering::Relaxed))
    }

    fn store_default_height(&self, height: f64) {
        self.default_height.store(height.to_bits(), Ordering::Relaxed);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Run the observers once the lock is released.
    fn notify(&self, state: MutexGuard<'_, RegistryState>) {
        let observers = state.observers.clone();
        drop(state);
        for observer in observers {
            observer();
        }
    }

    fn acquire(self: &Arc<Self>) -> ElevationWorker {
        let mut state = self.lock_state();
        let claimed = state
            .pool
            .iter()
            .find_map(|slot| slot.checkout().map(|handler| (Arc::clone(slot), handler)));

        let (slot, mut handler) = match claimed {
            Some(claimed) => claimed,
            None => {
                let slot = Arc::new(HandlerSlot::new());
                state.pool.push(Arc::clone(&slot));
                tracing::debug!(pool_size = state.pool.len(), "Allocated elevation handler");
                (slot, DemHandler::new(Arc::clone(&self.driver), self.window_size))
            }
        };
        if slot.take_stale() {
            handler.apply(&state.handler_config());
        }
        drop(state);

        ElevationWorker::new(Arc::clone(self), slot, handler)
    }
}

/// Elevation registry.
///
/// Owns the DEM/geoid configuration and the handler pool. Share it by
/// reference (or `Arc`) with every component that queries elevations; all
/// methods take `&self`. Dropping the registry closes every source, empties
/// the pool and removes the temporary mosaic and composite files.
///
/// # Example
///
/// ```no_run
/// use demkit::Registry;
///
/// # fn main() -> demkit::Result<()> {
/// let registry = Registry::new()?;
/// registry.open_dem_directory("/data/srtm");
/// registry.open_geoid_file("/data/egm96.tif");
///
/// let hae = registry.get_height_above_ellipsoid(138.7274, 35.3606);
/// let msl = registry.get_height_above_msl(138.7274, 35.3606);
/// # Ok(())
/// # }
/// ```
pub struct Registry {
    shared: Arc<Shared>,
}

impl Registry {
    /// Create an empty registry with default settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the temporary work directory cannot be created.
    pub fn new() -> Result<Self> {
        Self::with_settings(
            crate::elevation_cache::DEFAULT_WINDOW_SIZE,
            crate::raster::DEFAULT_CACHE_SIZE,
        )
    }

    /// Create a builder for custom configuration.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub(crate) fn with_settings(window_size: usize, cache_size: u64) -> Result<Self> {
        let workdir = tempfile::Builder::new().prefix("demkit-").tempdir()?;
        let state = RegistryState {
            sources: Vec::new(),
            directories: Vec::new(),
            geoid: None,
            mosaic: None,
            composite: None,
            generation: 0,
            pool: Vec::new(),
            observers: Vec::new(),
            workdir: Some(workdir),
        };
        Ok(Self {
            shared: Arc::new(Shared {
                id: NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed),
                driver: Arc::new(RasterDriver::new(cache_size)),
                window_size,
                default_height: AtomicU64::new(0f64.to_bits()),
                closed: AtomicBool::new(false),
                state: Mutex::new(state),
            }),
        })
    }

    /// Add one DEM file to the sources and rebuild the mosaic.
    ///
    /// The path is also recorded in the directory list.
    ///
    /// # Errors
    ///
    /// Returns the open error if the file cannot be read, or the mosaic error
    /// if the file cannot join the current sources (not georeferenced,
    /// different resolution or spatial reference). In both cases the
    /// configuration is left exactly as it was.
    pub fn open_dem_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let driver = &self.shared.driver;
        let mut state = self.shared.lock_state();

        let handle = driver.open(path).inspect_err(|e| {
            tracing::warn!(path = %path.display(), error = %e, "Cannot open DEM file");
        })?;
        state.sources.push(handle);

        if let Err(e) = state.rebuild_mosaic(driver) {
            state.sources.pop();
            tracing::warn!(path = %path.display(), error = %e, "DEM file rejected, previous sources kept");
            return Err(e);
        }

        state.directories.push(path.to_path_buf());
        state.ensure_composite(driver);
        self.shared.notify(state);
        Ok(())
    }

    /// Add every georeferenced raster under `path` (recursively) to the
    /// sources and rebuild the mosaic.
    ///
    /// Opening a directory twice is a no-op that returns `true`. Files that
    /// are not rasters, cannot be read, or have no geotransform are skipped.
    ///
    /// # Returns
    ///
    /// `false` if no usable raster was found (nothing changes), or if the
    /// rebuilt mosaic is unusable, in which case every DEM source and
    /// directory is dropped.
    pub fn open_dem_directory(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        let driver = &self.shared.driver;
        let mut state = self.shared.lock_state();

        if state.directories.iter().any(|dir| dir == path) {
            tracing::info!(path = %path.display(), "DEM directory already opened");
            return true;
        }

        let mut found = Vec::new();
        for file in dem_files_in(path) {
            match driver.open(&file) {
                Ok(handle) if handle.info().geo_transform.is_some() => found.push(handle),
                Ok(_) => {
                    tracing::info!(path = %file.display(), "Skipping DEM file without geotransform");
                }
                Err(e) => {
                    tracing::debug!(path = %file.display(), error = %e, "Skipping unreadable file");
                }
            }
        }
        if found.is_empty() {
            tracing::warn!(path = %path.display(), "No DEM found");
            return false;
        }

        let count = found.len();
        state.sources.extend(found);
        state.directories.push(path.to_path_buf());

        if let Err(e) = state.rebuild_mosaic(driver) {
            tracing::warn!(path = %path.display(), error = %e, "DEM mosaic unusable, dropping all DEM sources");
            state.sources.clear();
            state.directories.clear();
            state.drop_mosaic();
            return false;
        }

        tracing::info!(path = %path.display(), files = count, "Opened DEM directory");
        state.ensure_composite(driver);
        self.shared.notify(state);
        true
    }

    /// Use `path` as the geoid.
    ///
    /// # Returns
    ///
    /// `false` (configuration unchanged) if the file cannot be opened, is not
    /// georeferenced, or has no spatial reference.
    pub fn open_geoid_file(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        let driver = &self.shared.driver;
        let mut state = self.shared.lock_state();

        if let Err(e) = check_geoid(driver, path) {
            tracing::warn!(path = %path.display(), error = %e, "Cannot use geoid file");
            return false;
        }

        state.geoid = Some(path.to_path_buf());
        state.mark_handlers_stale();
        state.ensure_composite(driver);
        self.shared.notify(state);
        true
    }

    /// Drop every DEM source, directory and the geoid, and reset the default
    /// height to 0.
    pub fn clear(&self) {
        let mut state = self.shared.lock_state();
        self.shared.store_default_height(0.0);
        state.clear();
        self.shared.driver.clear_cache();
        self.shared.notify(state);
    }

    /// Set the height returned by [`get_height_above_ellipsoid`](Self::get_height_above_ellipsoid)
    /// where neither DEM nor geoid has a value.
    pub fn set_default_height(&self, height: f64) {
        let state = self.shared.lock_state();
        self.shared.store_default_height(height);
        self.shared.notify(state);
    }

    /// The default height above ellipsoid.
    pub fn default_height(&self) -> f64 {
        self.shared.default_height()
    }

    /// Number of DEM sources in the mosaic.
    pub fn dem_count(&self) -> usize {
        self.shared.lock_state().sources.len()
    }

    /// The `index`-th opened DEM directory (or file).
    ///
    /// # Errors
    ///
    /// Returns [`DemError::OutOfRange`] if fewer directories have been set.
    pub fn dem_directory(&self, index: usize) -> Result<PathBuf> {
        let state = self.shared.lock_state();
        state
            .directories
            .get(index)
            .cloned()
            .ok_or(DemError::OutOfRange {
                index,
                count: state.directories.len(),
            })
    }

    /// Every opened DEM directory (or file), in order.
    pub fn dem_directories(&self) -> Vec<PathBuf> {
        self.shared.lock_state().directories.clone()
    }

    /// The geoid file, if one is set.
    pub fn geoid_file(&self) -> Option<PathBuf> {
        self.shared.lock_state().geoid.clone()
    }

    /// Path of the current DEM mosaic descriptor.
    pub fn mosaic_path(&self) -> Option<PathBuf> {
        self.shared
            .lock_state()
            .mosaic
            .as_ref()
            .map(|mosaic| mosaic.path.clone())
    }

    /// Path of the geoid-shifted DEM (DEM + geoid on the DEM grid), built
    /// once both a DEM and a geoid are configured.
    pub fn composite_path(&self) -> Option<PathBuf> {
        self.shared
            .lock_state()
            .composite
            .as_ref()
            .map(|composite| composite.path.clone())
    }

    /// Register a callback run after every successful configuration change.
    pub fn add_observer<F>(&self, observer: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared.lock_state().observers.push(Arc::new(observer));
    }

    /// Number of handlers in the pool, claimed or parked.
    pub fn pool_size(&self) -> usize {
        self.shared.lock_state().pool.len()
    }

    /// Number of parked (unclaimed) handlers.
    pub fn idle_handlers(&self) -> usize {
        self.shared
            .lock_state()
            .pool
            .iter()
            .filter(|slot| slot.is_parked())
            .count()
    }

    /// Statistics of the shared decoded-raster cache.
    pub fn cache_stats(&self) -> CacheStats {
        self.shared.driver.cache_stats()
    }

    /// True when `path` contains at least one file with a raster extension.
    pub fn is_valid_dem_directory(path: impl AsRef<Path>) -> bool {
        dem_files_in(path).iter().any(|file| is_raster_path(file))
    }

    /// Check a handler out of the pool, creating one if every handler is
    /// claimed. The handler goes back to the pool when the worker is dropped.
    pub fn acquire(&self) -> ElevationWorker {
        self.shared.acquire()
    }

    fn with_thread_worker<R>(&self, f: impl FnOnce(&mut ElevationWorker) -> R) -> R {
        WORKERS.with(|workers| {
            let mut workers = workers.borrow_mut();
            workers.retain(|worker| !worker.is_orphaned());
            let index = match workers
                .iter()
                .position(|worker| worker.registry_id() == self.shared.id)
            {
                Some(index) => index,
                None => {
                    workers.push(self.shared.acquire());
                    workers.len() - 1
                }
            };
            f(&mut workers[index])
        })
    }

    /// Return the calling thread's worker to the pool now rather than at
    /// thread exit.
    pub fn release_current_thread(&self) {
        let released: Vec<ElevationWorker> = WORKERS.with(|workers| {
            let mut workers = workers.borrow_mut();
            let (released, kept) = workers
                .drain(..)
                .partition(|worker| worker.registry_id() == self.shared.id);
            *workers = kept;
            released
        });
        drop(released);
    }

    /// Height above the WGS84 ellipsoid at `(lon, lat)` in degrees.
    ///
    /// DEM height plus geoid undulation; if only one of them has a value it
    /// is returned alone; if neither does, the default height.
    pub fn get_height_above_ellipsoid(&self, lon: f64, lat: f64) -> f64 {
        self.with_thread_worker(|worker| worker.height_above_ellipsoid(lon, lat))
    }

    /// Height above mean sea level at `(lon, lat)`, 0 where the DEM has no value.
    pub fn get_height_above_msl(&self, lon: f64, lat: f64) -> f64 {
        self.get_height_above_msl_or(lon, lat, 0.0)
    }

    /// Height above mean sea level at `(lon, lat)`, `fallback` where the DEM
    /// has no value.
    pub fn get_height_above_msl_or(&self, lon: f64, lat: f64, fallback: f64) -> f64 {
        self.with_thread_worker(|worker| worker.height_above_msl(lon, lat))
            .unwrap_or(fallback)
    }

    /// Geoid undulation at `(lon, lat)`, 0 where the geoid has no value.
    pub fn get_geoid_height(&self, lon: f64, lat: f64) -> f64 {
        self.get_geoid_height_or(lon, lat, 0.0)
    }

    /// Geoid undulation at `(lon, lat)`, `fallback` where the geoid has no value.
    pub fn get_geoid_height_or(&self, lon: f64, lat: f64, fallback: f64) -> f64 {
        self.with_thread_worker(|worker| worker.geoid_height(lon, lat))
            .unwrap_or(fallback)
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        let mut state = self.shared.lock_state();
        state.clear();
        state.pool.clear();
        state.observers.clear();
        if let Some(workdir) = state.workdir.take() {
            if let Err(e) = workdir.close() {
                tracing::warn!(error = %e, "Cannot remove elevation work directory");
            }
        }
        drop(state);
        self.shared.driver.clear_cache();
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock_state();
        f.debug_struct("Registry")
            .field("id", &self.shared.id)
            .field("dem_count", &state.sources.len())
            .field("directories", &state.directories)
            .field("geoid", &state.geoid)
            .field("pool_size", &state.pool.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::geotiff::test_support::write_geotiff;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    const IDENTITY: [f64; 6] = [0.0, 1.0, 0.0, 0.0, 0.0, 1.0];

    fn write_constant(path: &Path, origin_x: f64, value: f32) {
        let gt = [origin_x, 1.0, 0.0, 0.0, 0.0, 1.0];
        write_geotiff(path, 4, 4, &[value; 16], gt, Some(4326), Some(-9999.0));
    }

    #[test]
    fn test_open_dem_file_records_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dem.tif");
        write_constant(&path, 0.0, 100.0);

        let registry = Registry::new().unwrap();
        registry.open_dem_file(&path).unwrap();

        assert_eq!(registry.dem_count(), 1);
        assert_eq!(registry.dem_directory(0).unwrap(), path);
        assert!(registry.mosaic_path().unwrap().exists());
        assert_eq!(registry.get_height_above_msl(2.0, 2.0), 100.0);
    }

    #[test]
    fn test_open_dem_file_rolls_back_on_incompatible_source() {
        let dir = TempDir::new().unwrap();
        let good = dir.path().join("good.tif");
        write_constant(&good, 0.0, 100.0);
        let coarse = dir.path().join("coarse.tif");
        write_geotiff(&coarse, 2, 2, &[1.0; 4], [4.0, 2.0, 0.0, 0.0, 0.0, 2.0], Some(4326), None);

        let registry = Registry::new().unwrap();
        registry.open_dem_file(&good).unwrap();
        let before = registry.mosaic_path();

        let result = registry.open_dem_file(&coarse);
        assert!(matches!(result, Err(DemError::IncompatibleSources { .. })));
        assert_eq!(registry.dem_count(), 1);
        assert_eq!(registry.dem_directories(), vec![good]);
        assert_eq!(registry.mosaic_path(), before);
        assert_eq!(registry.get_height_above_msl(2.0, 2.0), 100.0);
    }

    #[test]
    fn test_open_dem_file_missing() {
        let registry = Registry::new().unwrap();
        assert!(registry.open_dem_file("/nonexistent/dem.tif").is_err());
        assert_eq!(registry.dem_count(), 0);
        assert!(registry.dem_directories().is_empty());
    }

    #[test]
    fn test_dem_directory_out_of_range() {
        let registry = Registry::new().unwrap();
        match registry.dem_directory(0) {
            Err(DemError::OutOfRange { index, count }) => {
                assert_eq!((index, count), (0, 0));
            }
            other => panic!("Expected OutOfRange, got {other:?}"),
        }
    }

    #[test]
    fn test_open_dem_directory_is_idempotent() {
        let dir = TempDir::new().unwrap();
        write_constant(&dir.path().join("dem.tif"), 0.0, 100.0);

        let registry = Registry::new().unwrap();
        assert!(registry.open_dem_directory(dir.path()));
        assert!(registry.open_dem_directory(dir.path()));
        assert_eq!(registry.dem_count(), 1);
        assert_eq!(registry.dem_directories().len(), 1);
    }

    #[test]
    fn test_open_dem_directory_without_dem_is_noop() {
        let empty = TempDir::new().unwrap();
        std::fs::write(empty.path().join("notes.txt"), "no rasters here").unwrap();

        let registry = Registry::new().unwrap();
        let notified = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&notified);
        registry.add_observer(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!registry.open_dem_directory(empty.path()));
        assert_eq!(registry.dem_count(), 0);
        assert!(registry.dem_directories().is_empty());
        assert_eq!(notified.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unusable_mosaic_drops_everything() {
        let first = TempDir::new().unwrap();
        write_constant(&first.path().join("dem.tif"), 0.0, 100.0);
        let mixed = TempDir::new().unwrap();
        write_geotiff(
            &mixed.path().join("coarse.tif"),
            2,
            2,
            &[1.0; 4],
            [4.0, 2.0, 0.0, 0.0, 0.0, 2.0],
            Some(4326),
            None,
        );

        let registry = Registry::new().unwrap();
        assert!(registry.open_dem_directory(first.path()));
        assert!(!registry.open_dem_directory(mixed.path()));

        assert_eq!(registry.dem_count(), 0);
        assert!(registry.dem_directories().is_empty());
        assert!(registry.mosaic_path().is_none());
        assert_eq!(registry.get_height_above_msl(2.0, 2.0), 0.0);
    }

    #[test]
    fn test_geoid_requires_spatial_reference() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("geoid.tif");
        write_geotiff(&path, 4, 4, &[20.0; 16], IDENTITY, None, None);

        assert!(matches!(
            check_geoid(&RasterDriver::default(), &path),
            Err(DemError::MissingSpatialReference { .. })
        ));

        let registry = Registry::new().unwrap();
        assert!(!registry.open_geoid_file(&path));
        assert!(registry.geoid_file().is_none());
        assert!(!registry.open_geoid_file(dir.path().join("missing.tif")));
    }

    #[test]
    fn test_composite_built_once_per_inputs() {
        let dir = TempDir::new().unwrap();
        let dem = dir.path().join("dem.tif");
        write_constant(&dem, 0.0, 100.0);
        let geoid = dir.path().join("geoid.tif");
        write_geotiff(&geoid, 4, 4, &[20.0; 16], IDENTITY, Some(4326), None);

        let registry = Registry::new().unwrap();
        assert!(registry.open_geoid_file(&geoid));
        assert!(registry.composite_path().is_none());

        registry.open_dem_file(&dem).unwrap();
        let composite = registry.composite_path().expect("composite after DEM + geoid");

        let driver = RasterDriver::default();
        let mut shifted = DatasetCache::open(&driver, &composite).unwrap();
        let center = shifted.read_window(1, 1, 2, 2).unwrap();
        assert!(center.iter().all(|v| (v - 120.0).abs() < 1e-9));

        // Same inputs: nothing rebuilt
        let modified = std::fs::metadata(&composite).unwrap().modified().unwrap();
        assert!(registry.open_geoid_file(&geoid));
        assert_eq!(std::fs::metadata(&composite).unwrap().modified().unwrap(), modified);

        registry.clear();
        assert!(registry.composite_path().is_none());
        assert!(!composite.exists());
    }

    #[test]
    fn test_composite_rebuilt_when_inputs_change() {
        let dir = TempDir::new().unwrap();
        let dem = dir.path().join("dem.tif");
        write_constant(&dem, 0.0, 100.0);
        let geoid = dir.path().join("geoid.tif");
        write_geotiff(&geoid, 4, 4, &[20.0; 16], IDENTITY, Some(4326), None);
        let other_geoid = dir.path().join("geoid_b.tif");
        write_geotiff(&other_geoid, 4, 4, &[-5.0; 16], IDENTITY, Some(4326), None);
        let overlay = TempDir::new().unwrap();
        write_constant(&overlay.path().join("overlay.tif"), 0.0, 7.0);

        let registry = Registry::new().unwrap();
        registry.open_dem_file(&dem).unwrap();
        assert!(registry.open_geoid_file(&geoid));

        let driver = RasterDriver::default();
        let shifted = |registry: &Registry| {
            let composite = registry.composite_path().expect("composite after DEM + geoid");
            let mut dataset = DatasetCache::open(&driver, &composite).unwrap();
            dataset.read_window(1, 1, 2, 2).unwrap()
        };
        assert!(shifted(&registry).iter().all(|v| (v - 120.0).abs() < 1e-9));

        // New mosaic generation
        assert!(registry.open_dem_directory(overlay.path()));
        assert!(shifted(&registry).iter().all(|v| (v - 27.0).abs() < 1e-9));

        // New geoid
        assert!(registry.open_geoid_file(&other_geoid));
        assert!(shifted(&registry).iter().all(|v| (v - 2.0).abs() < 1e-9));
    }

    #[test]
    fn test_sources_decoded_once_per_open() {
        let dir = TempDir::new().unwrap();
        for i in 0..6 {
            write_constant(&dir.path().join(format!("dem{i}.tif")), 4.0 * i as f64, i as f32 + 1.0);
        }

        let registry = Registry::with_settings(crate::elevation_cache::DEFAULT_WINDOW_SIZE, 2).unwrap();
        for _ in 0..3 {
            let before = registry.cache_stats().miss_count;
            assert!(registry.open_dem_directory(dir.path()));
            assert_eq!(registry.dem_count(), 6);
            assert_eq!(registry.cache_stats().miss_count, before + 6);

            // Workers open the mosaic without decoding its tiles
            let mut workers: Vec<_> = (0..3).map(|_| registry.acquire()).collect();
            assert_eq!(registry.cache_stats().miss_count, before + 6);

            for (i, worker) in workers.iter_mut().enumerate() {
                let lon = 4.0 * i as f64 + 2.0;
                assert_eq!(worker.height_above_msl(lon, 2.0), Some(i as f64 + 1.0));
            }
            drop(workers);
            registry.clear();
        }
    }

    #[test]
    fn test_clear_resets_configuration() {
        let dir = TempDir::new().unwrap();
        let dem = dir.path().join("dem.tif");
        write_constant(&dem, 0.0, 100.0);

        let registry = Registry::new().unwrap();
        registry.open_dem_file(&dem).unwrap();
        registry.set_default_height(42.0);
        assert_eq!(registry.get_height_above_msl(2.0, 2.0), 100.0);

        registry.clear();
        assert_eq!(registry.default_height(), 0.0);
        assert_eq!(registry.dem_count(), 0);
        assert!(registry.dem_directories().is_empty());
        assert!(registry.geoid_file().is_none());
        assert_eq!(registry.get_height_above_msl(2.0, 2.0), 0.0);
        assert_eq!(registry.get_height_above_ellipsoid(2.0, 2.0), 0.0);
    }

    #[test]
    fn test_observers_notified_on_success() {
        let dir = TempDir::new().unwrap();
        let dem = dir.path().join("dem.tif");
        write_constant(&dem, 0.0, 100.0);

        let registry = Registry::new().unwrap();
        let notified = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&notified);
        registry.add_observer(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        registry.open_dem_file(&dem).unwrap();
        registry.set_default_height(10.0);
        assert!(registry.open_dem_file(dir.path().join("missing.tif")).is_err());
        registry.clear();
        assert_eq!(notified.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_observer_may_query_registry() {
        let registry = Arc::new(Registry::new().unwrap());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let weak = Arc::downgrade(&registry);
        let sink = Arc::clone(&seen);
        registry.add_observer(move || {
            if let Some(registry) = weak.upgrade() {
                sink.lock().unwrap().push(registry.default_height());
                let _ = registry.dem_count();
            }
        });

        registry.set_default_height(12.5);
        assert_eq!(*seen.lock().unwrap(), vec![12.5]);
    }

    #[test]
    fn test_default_height_used_without_data() {
        let registry = Registry::new().unwrap();
        registry.set_default_height(33.0);
        assert_eq!(registry.get_height_above_ellipsoid(10.0, 10.0), 33.0);
        assert_eq!(registry.get_height_above_msl(10.0, 10.0), 0.0);
        assert_eq!(registry.get_height_above_msl_or(10.0, 10.0, -1.0), -1.0);
        assert_eq!(registry.get_geoid_height_or(10.0, 10.0, -2.0), -2.0);
    }

    #[test]
    fn test_parked_handler_sees_new_configuration() {
        let dir = TempDir::new().unwrap();
        let first = dir.path().join("a.tif");
        write_constant(&first, 0.0, 100.0);
        let second = TempDir::new().unwrap();
        write_constant(&second.path().join("b.tif"), 0.0, 7.0);

        let registry = Registry::new().unwrap();
        registry.open_dem_file(&first).unwrap();
        {
            let mut worker = registry.acquire();
            assert_eq!(worker.height_above_msl(2.0, 2.0), Some(100.0));
        }

        // Later sources paint over earlier ones
        assert!(registry.open_dem_directory(second.path()));
        let mut worker = registry.acquire();
        assert_eq!(worker.height_above_msl(2.0, 2.0), Some(7.0));
        assert_eq!(registry.pool_size(), 1);
    }

    #[test]
    fn test_claimed_worker_refreshes_between_queries() {
        let dir = TempDir::new().unwrap();
        let dem = dir.path().join("dem.tif");
        write_constant(&dem, 0.0, 100.0);

        let registry = Registry::new().unwrap();
        let mut worker = registry.acquire();
        assert_eq!(worker.height_above_msl(2.0, 2.0), None);

        registry.open_dem_file(&dem).unwrap();
        assert_eq!(worker.height_above_msl(2.0, 2.0), Some(100.0));

        registry.clear();
        assert_eq!(worker.height_above_msl(2.0, 2.0), None);
    }

    #[test]
    fn test_release_current_thread_parks_worker() {
        let registry = Registry::new().unwrap();
        registry.get_height_above_msl(0.0, 0.0);
        assert_eq!(registry.pool_size(), 1);
        assert_eq!(registry.idle_handlers(), 0);

        registry.release_current_thread();
        assert_eq!(registry.idle_handlers(), 1);

        registry.get_height_above_msl(0.0, 0.0);
        assert_eq!(registry.pool_size(), 1);
    }

    #[test]
    fn test_drop_removes_work_directory() {
        let dir = TempDir::new().unwrap();
        let dem = dir.path().join("dem.tif");
        write_constant(&dem, 0.0, 100.0);

        let registry = Registry::new().unwrap();
        registry.open_dem_file(&dem).unwrap();
        let mosaic = registry.mosaic_path().unwrap();
        let workdir = mosaic.parent().unwrap().to_path_buf();

        let mut worker = registry.acquire();
        drop(registry);
        assert!(!workdir.exists());

        // A worker outliving its registry sees an empty configuration
        assert_eq!(worker.height_above_msl(2.0, 2.0), None);
        assert_eq!(worker.height_above_ellipsoid(2.0, 2.0), 0.0);
    }

    #[test]
    fn test_is_valid_dem_directory() {
        let dir = TempDir::new().unwrap();
        assert!(!Registry::is_valid_dem_directory(dir.path()));
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        write_constant(&dir.path().join("nested").join("dem.tif"), 0.0, 1.0);
        assert!(Registry::is_valid_dem_directory(dir.path()));
        assert!(!Registry::is_valid_dem_directory(dir.path().join("missing")));
    }

    #[test]
    fn test_dem_files_in_is_recursive() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("a").join("b")).unwrap();
        std::fs::write(dir.path().join("z.txt"), "").unwrap();
        std::fs::write(dir.path().join("a").join("b").join("c.hgt"), "").unwrap();

        let files = dem_files_in(dir.path());
        assert_eq!(files.len(), 2);
        assert_eq!(dem_files_in(dir.path().join("z.txt")), vec![dir.path().join("z.txt")]);
    }
}
