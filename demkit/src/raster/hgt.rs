//! SRTM `.hgt` tiles, plain or zipped.
//!
//! A tile is a square grid of 16-bit big-endian signed integers, row 0 at the
//! north edge. Resolution is detected from the file size. Georeferencing comes
//! from the tile name (see [`crate::filename`]); a tile whose name does not
//! parse opens as an un-georeferenced raster.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use memmap2::Mmap;

use super::geo::{GeoTransform, SpatialRef};
use super::{LoadedRaster, RasterInfo, Samples};
use crate::error::{DemError, Result};
use crate::filename::filename_to_lat_lon;

/// File size for SRTM1 (1 arc-second, ~30m resolution): 3601 × 3601 × 2 bytes
const SRTM1_SIZE: usize = 3601 * 3601 * 2;

/// File size for SRTM3 (3 arc-second, ~90m resolution): 1201 × 1201 × 2 bytes
const SRTM3_SIZE: usize = 1201 * 1201 * 2;

const SRTM1_SAMPLES: usize = 3601;
const SRTM3_SAMPLES: usize = 1201;

/// Value indicating no data (void) in SRTM files
pub const VOID_VALUE: i16 = -32768;

/// Resolution type of an SRTM tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SrtmResolution {
    /// SRTM1: 1 arc-second (~30m) resolution
    Srtm1,
    /// SRTM3: 3 arc-second (~90m) resolution
    Srtm3,
}

impl SrtmResolution {
    /// Detect the resolution from the size of the raw sample data.
    pub fn from_len(len: usize) -> Result<Self> {
        match len {
            SRTM1_SIZE => Ok(SrtmResolution::Srtm1),
            SRTM3_SIZE => Ok(SrtmResolution::Srtm3),
            size => Err(DemError::InvalidFileSize { size }),
        }
    }

    /// Number of samples per row/column.
    pub fn samples(&self) -> usize {
        match self {
            SrtmResolution::Srtm1 => SRTM1_SAMPLES,
            SrtmResolution::Srtm3 => SRTM3_SAMPLES,
        }
    }

    /// Approximate ground resolution in meters.
    pub fn meters(&self) -> f64 {
        match self {
            SrtmResolution::Srtm1 => 30.0,
            SrtmResolution::Srtm3 => 90.0,
        }
    }
}

/// Raw tile bytes, mapped from disk or extracted from an archive.
pub(crate) enum HgtBytes {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl HgtBytes {
    fn as_slice(&self) -> &[u8] {
        match self {
            HgtBytes::Mapped(mmap) => mmap,
            HgtBytes::Owned(bytes) => bytes,
        }
    }

    /// Read `count` consecutive samples starting at sample `index`.
    pub(crate) fn read_row(&self, index: usize, count: usize, out: &mut Vec<f64>) {
        let bytes = &self.as_slice()[index * 2..(index + count) * 2];
        out.extend(
            bytes
                .chunks_exact(2)
                .map(|pair| f64::from(i16::from_be_bytes([pair[0], pair[1]]))),
        );
    }
}

/// Memory-map a `.hgt` file.
pub(crate) fn load(path: &Path) -> Result<LoadedRaster> {
    let file = File::open(path)?;

    // SAFETY: Memory mapping is safe as long as the file is not modified
    // while mapped. We open the file read-only and don't expose the mapping.
    let mmap = unsafe { Mmap::map(&file)? };

    from_bytes(HgtBytes::Mapped(mmap), path)
}

/// Read the first `.hgt` entry of a `.hgt.zip` archive into memory.
pub(crate) fn load_zip(path: &Path) -> Result<LoadedRaster> {
    let file = File::open(path)?;
    let mut archive = zip::ZipArchive::new(file)?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if !entry.name().ends_with(".hgt") {
            continue;
        }
        let mut bytes = Vec::with_capacity(usize::try_from(entry.size()).unwrap_or(0));
        entry.read_to_end(&mut bytes)?;
        return from_bytes(HgtBytes::Owned(bytes), path);
    }

    Err(DemError::Io(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        format!("No .hgt file found in {}", path.display()),
    )))
}

fn from_bytes(bytes: HgtBytes, path: &Path) -> Result<LoadedRaster> {
    let resolution = SrtmResolution::from_len(bytes.as_slice().len())?;
    let samples = resolution.samples();

    let corner = path
        .file_name()
        .and_then(|name| name.to_str())
        .and_then(filename_to_lat_lon);
    let (geo_transform, spatial_ref) = match corner {
        Some((lat, lon)) => (
            Some(tile_geo_transform(lat, lon, samples)),
            Some(SpatialRef::wgs84()),
        ),
        None => (None, None),
    };

    Ok(LoadedRaster {
        info: RasterInfo {
            width: samples,
            height: samples,
            geo_transform,
            spatial_ref,
            no_data: Some(f64::from(VOID_VALUE)),
        },
        samples: Samples::Hgt(bytes),
    })
}

/// Samples sit on whole arc-second posts, so the grid origin is half a step
/// outside the tile's nominal 1° square.
fn tile_geo_transform(lat: i32, lon: i32, samples: usize) -> GeoTransform {
    let step = 1.0 / (samples - 1) as f64;
    GeoTransform([
        f64::from(lon) - step / 2.0,
        step,
        0.0,
        f64::from(lat) + 1.0 + step / 2.0,
        0.0,
        -step,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    /// Create a test SRTM3 file with known elevation values
    fn srtm3_bytes() -> Vec<u8> {
        let mut data = vec![0u8; SRTM3_SIZE];

        // Row 0, Col 0 (northwest corner) = 1000m
        data[..2].copy_from_slice(&1000i16.to_be_bytes());

        // Row 600, Col 600 (center) = 500m
        let center_offset = (600 * SRTM3_SAMPLES + 600) * 2;
        data[center_offset..center_offset + 2].copy_from_slice(&500i16.to_be_bytes());

        // Row 1200, Col 1200 (southeast corner) = void
        let se_offset = (1200 * SRTM3_SAMPLES + 1200) * 2;
        data[se_offset..se_offset + 2].copy_from_slice(&VOID_VALUE.to_be_bytes());
        data
    }

    fn write_tile(dir: &Path, name: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, srtm3_bytes()).unwrap();
        path
    }

    #[test]
    fn test_load_srtm3_file() {
        let dir = TempDir::new().unwrap();
        let tile = load(&write_tile(dir.path(), "N35E138.hgt")).unwrap();

        assert_eq!(tile.info.width, 1201);
        assert_eq!(tile.info.height, 1201);
        assert_eq!(tile.info.no_data, Some(-32768.0));
        assert_eq!(tile.info.spatial_ref, Some(SpatialRef::wgs84()));
    }

    #[test]
    fn test_tile_georeferencing() {
        let dir = TempDir::new().unwrap();
        let tile = load(&write_tile(dir.path(), "N35E138.hgt")).unwrap();
        let gt = tile.info.geo_transform.unwrap();

        // The centre post of the tile is pixel (600, 600)
        let (x, y) = gt.geo_to_pixel_center(138.5, 35.5);
        assert!((x - 600.0).abs() < 1e-6);
        assert!((y - 600.0).abs() < 1e-6);

        // North-west post
        let (x, y) = gt.geo_to_pixel_center(138.0, 36.0);
        assert!(x.abs() < 1e-6 && y.abs() < 1e-6);
    }

    #[test]
    fn test_read_samples() {
        let dir = TempDir::new().unwrap();
        let tile = load(&write_tile(dir.path(), "N35E138.hgt")).unwrap();

        assert_eq!(tile.read(0, 0, 2, 1), vec![1000.0, 0.0]);
        assert_eq!(tile.read(600, 600, 1, 1), vec![500.0]);
        assert_eq!(tile.read(1200, 1200, 1, 1), vec![-32768.0]);
    }

    #[test]
    fn test_unparseable_name_is_not_georeferenced() {
        let dir = TempDir::new().unwrap();
        let tile = load(&write_tile(dir.path(), "scan.hgt")).unwrap();

        assert!(tile.info.geo_transform.is_none());
        assert!(tile.info.spatial_ref.is_none());
    }

    #[test]
    fn test_invalid_file_size() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("N35E138.hgt");
        std::fs::write(&path, vec![0u8; 1000]).unwrap();

        match load(&path) {
            Err(DemError::InvalidFileSize { size }) => assert_eq!(size, 1000),
            Err(e) => panic!("Expected InvalidFileSize, got {e}"),
            Ok(_) => panic!("Expected InvalidFileSize"),
        }
    }

    #[test]
    fn test_load_zipped_tile() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("N35E138.hgt.zip");
        let mut writer = zip::ZipWriter::new(std::fs::File::create(&path).unwrap());
        writer
            .start_file("N35E138.hgt", zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(&srtm3_bytes()).unwrap();
        writer.finish().unwrap();

        let tile = load_zip(&path).unwrap();
        assert_eq!(tile.read(600, 600, 1, 1), vec![500.0]);
        assert!(tile.info.geo_transform.is_some());
    }

    #[test]
    fn test_resolution_info() {
        assert_eq!(SrtmResolution::Srtm1.samples(), 3601);
        assert_eq!(SrtmResolution::Srtm3.samples(), 1201);
        assert_eq!(SrtmResolution::Srtm1.meters(), 30.0);
        assert_eq!(
            SrtmResolution::from_len(SRTM3_SIZE).unwrap(),
            SrtmResolution::Srtm3
        );
    }
}
