//! Registry construction from code or the environment.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::elevation_cache::DEFAULT_WINDOW_SIZE;
use crate::error::{DemError, Result};
use crate::raster::DEFAULT_CACHE_SIZE;
use crate::registry::Registry;

/// Builder for [`Registry`] with custom configuration.
///
/// # Example
///
/// ```no_run
/// use demkit::RegistryBuilder;
///
/// # fn main() -> demkit::Result<()> {
/// let registry = RegistryBuilder::new()
///     .dem_directory("/data/srtm")
///     .geoid_file("/data/egm96.tif")
///     .default_height(0.0)
///     .window_size(128)
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct RegistryBuilder {
    dem_directories: Vec<PathBuf>,
    dem_files: Vec<PathBuf>,
    geoid_file: Option<PathBuf>,
    default_height: f64,
    window_size: usize,
    cache_size: u64,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn path_list(name: &str) -> Vec<PathBuf> {
    std::env::var_os(name)
        .map(|value| std::env::split_paths(&value).filter(|p| !p.as_os_str().is_empty()).collect())
        .unwrap_or_default()
}

impl RegistryBuilder {
    /// Create a builder with nothing configured.
    pub fn new() -> Self {
        Self {
            dem_directories: Vec::new(),
            dem_files: Vec::new(),
            geoid_file: None,
            default_height: 0.0,
            window_size: DEFAULT_WINDOW_SIZE,
            cache_size: DEFAULT_CACHE_SIZE,
        }
    }

    /// Create a builder configured from environment variables.
    ///
    /// # Environment Variables
    ///
    /// | Variable | Description | Default |
    /// |----------|-------------|---------|
    /// | `DEMKIT_DEM_DIR` | DEM directories, separated like `PATH` | None |
    /// | `DEMKIT_DEM_FILE` | Single DEM files, separated like `PATH` | None |
    /// | `DEMKIT_GEOID_FILE` | Geoid raster | None |
    /// | `DEMKIT_DEFAULT_HEIGHT` | Height above ellipsoid where no data exists | 0 |
    /// | `DEMKIT_WINDOW_SIZE` | Edge of the per-handler read window, in pixels | 64 |
    /// | `DEMKIT_CACHE_SIZE` | Maximum decoded rasters in cache | 100 |
    ///
    /// ```bash
    /// export DEMKIT_DEM_DIR=/data/srtm:/data/copernicus
    /// export DEMKIT_GEOID_FILE=/data/egm96.tif
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`DemError::InvalidConfig`] if `DEMKIT_DEFAULT_HEIGHT` is set
    /// but is not a number.
    pub fn from_env() -> Result<Self> {
        let default_height = match std::env::var("DEMKIT_DEFAULT_HEIGHT") {
            Ok(value) => value.trim().parse().map_err(|_| DemError::InvalidConfig {
                name: "DEMKIT_DEFAULT_HEIGHT",
                value,
            })?,
            Err(_) => 0.0,
        };

        let window_size: usize = std::env::var("DEMKIT_WINDOW_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_WINDOW_SIZE);

        let cache_size: u64 = std::env::var("DEMKIT_CACHE_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_CACHE_SIZE);

        Ok(Self {
            dem_directories: path_list("DEMKIT_DEM_DIR"),
            dem_files: path_list("DEMKIT_DEM_FILE"),
            geoid_file: std::env::var_os("DEMKIT_GEOID_FILE")
                .filter(|value: &OsString| !value.is_empty())
                .map(PathBuf::from),
            default_height,
            window_size,
            cache_size,
        })
    }

    /// Add a DEM directory, opened with [`Registry::open_dem_directory`].
    pub fn dem_directory<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.dem_directories.push(path.as_ref().to_path_buf());
        self
    }

    /// Add a single DEM file, opened with [`Registry::open_dem_file`].
    pub fn dem_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.dem_files.push(path.as_ref().to_path_buf());
        self
    }

    /// Set the geoid raster.
    pub fn geoid_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.geoid_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set the height returned where neither DEM nor geoid has data.
    pub fn default_height(mut self, height: f64) -> Self {
        self.default_height = height;
        self
    }

    /// Set the edge length, in pixels, of each handler's read window.
    ///
    /// Default is 64; values below 2 are raised to 2.
    pub fn window_size(mut self, size: usize) -> Self {
        self.window_size = size;
        self
    }

    /// Set the maximum number of decoded rasters kept in cache.
    ///
    /// Default is 100.
    pub fn cache_size(mut self, size: u64) -> Self {
        self.cache_size = size;
        self
    }

    /// Build the [`Registry`].
    ///
    /// Directories and the geoid that cannot be used are logged and skipped,
    /// as the registry operations themselves do.
    ///
    /// # Errors
    ///
    /// Returns an error if the work directory cannot be created or a DEM
    /// file cannot be opened.
    pub fn build(self) -> Result<Registry> {
        let registry = Registry::with_settings(self.window_size.max(2), self.cache_size)?;
        registry.set_default_height(self.default_height);

        for dir in &self.dem_directories {
            if !registry.open_dem_directory(dir) {
                tracing::warn!(path = %dir.display(), "DEM directory not used");
            }
        }
        for file in &self.dem_files {
            registry.open_dem_file(file)?;
        }
        if let Some(geoid) = &self.geoid_file {
            if !registry.open_geoid_file(geoid) {
                tracing::warn!(path = %geoid.display(), "Geoid file not used");
            }
        }
        Ok(registry)
    }
}
