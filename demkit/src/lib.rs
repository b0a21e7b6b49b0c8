//! # demkit - thread-partitioned elevation queries
//!
//! Point elevation queries over a mosaic of DEM rasters and a geoid grid,
//! designed for callers that query from many threads at once.
//!
//! ## Features
//!
//! - **Mosaics**: any number of SRTM `.hgt`, `.hgt.zip` or GeoTIFF tiles,
//!   opened file by file or a directory tree at a time, queried as one raster
//! - **Geoid aware**: heights above mean sea level, geoid undulation, and
//!   heights above the WGS84 ellipsoid
//! - **Reprojection**: DEMs in projected references are queried in WGS84
//! - **Lock-free queries**: every thread queries through its own handler and
//!   read window; configuration changes reach handlers between queries
//!
//! ## Quick Start
//!
//! ```no_run
//! use demkit::Registry;
//!
//! # fn main() -> demkit::Result<()> {
//! let registry = Registry::new()?;
//! registry.open_dem_directory("/data/srtm");
//! registry.open_geoid_file("/data/egm96.tif");
//!
//! // Mount Fuji
//! let msl = registry.get_height_above_msl(138.7274, 35.3606);
//! let hae = registry.get_height_above_ellipsoid(138.7274, 35.3606);
//! # Ok(())
//! # }
//! ```
//!
//! ## Query semantics
//!
//! Heights are bilinear interpolations of the four pixel centres around the
//! query point. A point with any no-data neighbour, or outside the raster
//! (including the last half pixel along each edge), has no value:
//!
//! | Query | No value |
//! |-------|----------|
//! | [`Registry::get_height_above_msl`] | 0 |
//! | [`Registry::get_geoid_height`] | 0 |
//! | [`Registry::get_height_above_ellipsoid`] | DEM alone, geoid alone, else the default height |

pub mod config;
pub mod dataset;
pub mod elevation_cache;
pub mod error;
pub mod filename;
pub mod handler;
mod pool;
pub mod raster;
pub mod registry;

// Re-export main types at crate root for convenience
pub use config::RegistryBuilder;
pub use dataset::DatasetCache;
pub use elevation_cache::{ElevationCache, DEFAULT_WINDOW_SIZE};
pub use error::{DemError, Result};
pub use handler::{DemHandler, ElevationSource, HandlerConfig};
pub use pool::ElevationWorker;
pub use raster::{CacheStats, RasterDriver, RasterInfo, SpatialRef};
pub use registry::{Observer, Registry};
