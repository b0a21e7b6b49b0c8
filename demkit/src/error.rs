//! Error types for the demkit library.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur when opening rasters or configuring the registry.
///
/// Elevation queries never return these: a point without data is reported
/// as `None` (or the configured fallback), not as an error.
#[derive(Error, Debug)]
pub enum DemError {
    /// IO error when reading or writing files.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// GeoTIFF decoding failed.
    #[error("TIFF error: {0}")]
    Tiff(#[from] tiff::TiffError),

    /// A `.hgt.zip` archive could not be read.
    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// A virtual raster descriptor could not be (de)serialized.
    #[error("Descriptor error: {0}")]
    Json(#[from] serde_json::Error),

    /// File size doesn't match SRTM1 or SRTM3 format.
    #[error("Invalid file size: {size} bytes (expected 25934402 for SRTM1 or 2884802 for SRTM3)")]
    InvalidFileSize { size: usize },

    /// The file extension is not a recognised raster format.
    #[error("Unsupported raster format: {path}")]
    UnsupportedFormat { path: PathBuf },

    /// The raster has no affine geotransform.
    #[error("Raster has no geotransform: {path}")]
    MissingGeoTransform { path: PathBuf },

    /// The raster has no spatial reference.
    #[error("Raster has no spatial reference: {path}")]
    MissingSpatialReference { path: PathBuf },

    /// A coordinate transformation could not be built or applied.
    #[error("Projection error: {0}")]
    Projection(String),

    /// A block read fell outside the raster extent.
    #[error(
        "Window {width}x{height} at ({x}, {y}) is outside the {raster_width}x{raster_height} raster"
    )]
    WindowOutOfBounds {
        x: usize,
        y: usize,
        width: usize,
        height: usize,
        raster_width: usize,
        raster_height: usize,
    },

    /// Mosaic sources cannot be combined on one grid.
    #[error("Incompatible mosaic sources: {reason}")]
    IncompatibleSources { reason: String },

    /// A mosaic needs at least one source.
    #[error("Cannot build a mosaic without sources")]
    EmptyMosaic,

    /// Indexed access past the end of a list.
    #[error("Requested DEM directory {index}, but only {count} have been set.")]
    OutOfRange { index: usize, count: usize },

    /// An environment variable held an unusable value.
    #[error("Invalid value for {name}: {value:?}")]
    InvalidConfig { name: &'static str, value: String },

    /// The registry was torn down.
    #[error("Elevation registry has been closed")]
    Closed,
}

/// Result type alias using [`DemError`].
pub type Result<T> = std::result::Result<T, DemError>;
