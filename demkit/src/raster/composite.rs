//! Virtual rasters assembled from other rasters.
//!
//! A virtual raster is a small JSON descriptor on disk naming its sources.
//! Opening one decodes nothing: sources are read through the driver's cache
//! as reads reach them.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::geo::{CoordinateTransform, GeoTransform, SpatialRef};
use super::{bilinear, RasterDriver, RasterHandle, RasterInfo};
use crate::error::{DemError, Result};

/// No-data value of virtual rasters whose first source declares none.
pub const MOSAIC_NO_DATA: f64 = -32768.0;

const OFF_GRID_TOLERANCE: f64 = 1e-3;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub(crate) enum Descriptor {
    Mosaic(MosaicDescriptor),
    Sum(SumDescriptor),
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct MosaicDescriptor {
    width: usize,
    height: usize,
    geo_transform: GeoTransform,
    spatial_ref: Option<SpatialRef>,
    no_data: f64,
    sources: Vec<MosaicSource>,
}

#[derive(Debug, Serialize, Deserialize)]
struct MosaicSource {
    path: PathBuf,
    x_offset: usize,
    y_offset: usize,
    width: usize,
    height: usize,
    #[serde(default)]
    no_data: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct SumDescriptor {
    base: PathBuf,
    addend: PathBuf,
    no_data: f64,
}

pub(crate) fn read_descriptor(path: &Path) -> Result<Descriptor> {
    let reader = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
}

fn write_descriptor(descriptor: &Descriptor, dest: &Path) -> Result<()> {
    let mut writer = BufWriter::new(File::create(dest)?);
    serde_json::to_writer_pretty(&mut writer, descriptor)?;
    writer.flush()?;
    Ok(())
}

fn require_geo_transform(handle: &RasterHandle) -> Result<GeoTransform> {
    handle
        .info()
        .geo_transform
        .ok_or_else(|| DemError::MissingGeoTransform {
            path: handle.path().to_path_buf(),
        })
}

fn incompatible(reason: String) -> DemError {
    DemError::IncompatibleSources { reason }
}

fn nearly_equal(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-9 * a.abs().max(b.abs())
}

fn same_reference(a: Option<&SpatialRef>, b: Option<&SpatialRef>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.is_same(b),
        (None, None) => true,
        _ => false,
    }
}

/// Where one source lands on the mosaic grid, relative to the first source.
struct Placement<'a> {
    path: &'a Path,
    column: i64,
    row: i64,
    width: usize,
    height: usize,
    no_data: Option<f64>,
}

pub(crate) fn write_mosaic(sources: &[&RasterHandle], dest: &Path) -> Result<()> {
    let first = sources.first().ok_or(DemError::EmptyMosaic)?;
    let reference = require_geo_transform(first)?;
    let (pixel_x, pixel_y) = reference.pixel_size();
    let spatial_ref = first.info().spatial_ref.clone();

    // Offsets of each source relative to the first, in whole pixels
    let mut placements = Vec::with_capacity(sources.len());
    for source in sources {
        let gt = require_geo_transform(source)?;
        let path = source.path().display();
        if !gt.is_axis_aligned() {
            return Err(incompatible(format!("{path} is rotated")));
        }
        if !nearly_equal(gt.0[1], pixel_x) || !nearly_equal(gt.0[5], pixel_y) {
            return Err(incompatible(format!(
                "{path} has pixel size {:?}, expected {:?}",
                gt.pixel_size(),
                (pixel_x, pixel_y)
            )));
        }
        if !same_reference(source.info().spatial_ref.as_ref(), spatial_ref.as_ref()) {
            return Err(incompatible(format!("{path} has a different spatial reference")));
        }

        let column = (gt.0[0] - reference.0[0]) / pixel_x;
        let row = (gt.0[3] - reference.0[3]) / pixel_y;
        if (column - column.round()).abs() > OFF_GRID_TOLERANCE
            || (row - row.round()).abs() > OFF_GRID_TOLERANCE
        {
            tracing::debug!(path = %path, column, row, "Snapping off-grid mosaic source");
        }
        let (width, height) = source.size();
        placements.push(Placement {
            path: source.path(),
            column: column.round() as i64,
            row: row.round() as i64,
            width,
            height,
            no_data: source.info().no_data,
        });
    }

    let min_column = placements.iter().map(|p| p.column).min().unwrap_or(0);
    let min_row = placements.iter().map(|p| p.row).min().unwrap_or(0);
    let max_column = placements.iter().map(|p| p.column + p.width as i64).max().unwrap_or(0);
    let max_row = placements.iter().map(|p| p.row + p.height as i64).max().unwrap_or(0);

    let mut geo_transform = reference;
    geo_transform.0[0] += min_column as f64 * pixel_x;
    geo_transform.0[3] += min_row as f64 * pixel_y;

    let descriptor = MosaicDescriptor {
        width: (max_column - min_column) as usize,
        height: (max_row - min_row) as usize,
        geo_transform,
        spatial_ref,
        no_data: first.info().no_data.unwrap_or(MOSAIC_NO_DATA),
        sources: placements
            .into_iter()
            .map(|p| MosaicSource {
                path: p.path.to_path_buf(),
                x_offset: (p.column - min_column) as usize,
                y_offset: (p.row - min_row) as usize,
                width: p.width,
                height: p.height,
                no_data: p.no_data,
            })
            .collect(),
    };
    write_descriptor(&Descriptor::Mosaic(descriptor), dest)
}

pub(crate) fn write_sum(base: &RasterHandle, addend: &RasterHandle, dest: &Path) -> Result<()> {
    require_geo_transform(base)?;
    require_geo_transform(addend)?;
    if let (Some(from), Some(to)) = (&base.info().spatial_ref, &addend.info().spatial_ref) {
        CoordinateTransform::new(from, to)?;
    }

    let descriptor = SumDescriptor {
        base: base.path().to_path_buf(),
        addend: addend.path().to_path_buf(),
        no_data: base.info().no_data.unwrap_or(MOSAIC_NO_DATA),
    };
    write_descriptor(&Descriptor::Sum(descriptor), dest)
}

struct MosaicTile {
    x_offset: usize,
    y_offset: usize,
    handle: RasterHandle,
}

pub(crate) struct MosaicRaster {
    tiles: Vec<MosaicTile>,
}

impl MosaicRaster {
    pub(crate) fn open(driver: &RasterDriver, descriptor: MosaicDescriptor) -> Result<(RasterInfo, Self)> {
        let (pixel_x, pixel_y) = descriptor.geo_transform.pixel_size();
        let mut tiles = Vec::with_capacity(descriptor.sources.len());
        for source in descriptor.sources {
            let mut geo_transform = descriptor.geo_transform;
            geo_transform.0[0] += source.x_offset as f64 * pixel_x;
            geo_transform.0[3] += source.y_offset as f64 * pixel_y;
            let info = RasterInfo {
                width: source.width,
                height: source.height,
                geo_transform: Some(geo_transform),
                spatial_ref: descriptor.spatial_ref.clone(),
                no_data: source.no_data,
            };
            let handle = driver.open_with_info(&source.path, info)?;
            if handle.size() != (source.width, source.height) {
                return Err(incompatible(format!(
                    "{} changed size since the mosaic was built",
                    source.path.display()
                )));
            }
            tiles.push(MosaicTile {
                x_offset: source.x_offset,
                y_offset: source.y_offset,
                handle,
            });
        }

        let info = RasterInfo {
            width: descriptor.width,
            height: descriptor.height,
            geo_transform: Some(descriptor.geo_transform),
            spatial_ref: descriptor.spatial_ref,
            no_data: Some(descriptor.no_data),
        };
        Ok((info, Self { tiles }))
    }

    pub(crate) fn read(
        &mut self,
        info: &RasterInfo,
        x: usize,
        y: usize,
        width: usize,
        height: usize,
    ) -> Result<Vec<f64>> {
        let mut out = vec![info.no_data.unwrap_or(MOSAIC_NO_DATA); width * height];

        for tile in &mut self.tiles {
            let (tile_width, tile_height) = tile.handle.size();
            let x0 = x.max(tile.x_offset);
            let y0 = y.max(tile.y_offset);
            let x1 = (x + width).min(tile.x_offset + tile_width);
            let y1 = (y + height).min(tile.y_offset + tile_height);
            if x0 >= x1 || y0 >= y1 {
                continue;
            }

            let block = tile
                .handle
                .read_block(x0 - tile.x_offset, y0 - tile.y_offset, x1 - x0, y1 - y0)?;
            for (r, row) in block.chunks_exact(x1 - x0).enumerate() {
                let start = (y0 + r - y) * width + (x0 - x);
                for (slot, &value) in out[start..start + row.len()].iter_mut().zip(row) {
                    if !tile.handle.info().is_no_data(value) {
                        *slot = value;
                    }
                }
            }
        }
        Ok(out)
    }
}

pub(crate) struct SumRaster {
    base: RasterHandle,
    addend: RasterHandle,
    base_transform: GeoTransform,
    addend_transform: GeoTransform,
    reprojection: Option<CoordinateTransform>,
}

impl SumRaster {
    pub(crate) fn open(driver: &RasterDriver, descriptor: SumDescriptor) -> Result<(RasterInfo, Self)> {
        let base = driver.open(&descriptor.base)?;
        let addend = driver.open(&descriptor.addend)?;
        let base_transform = require_geo_transform(&base)?;
        let addend_transform = require_geo_transform(&addend)?;
        let reprojection = match (&base.info().spatial_ref, &addend.info().spatial_ref) {
            (Some(from), Some(to)) => CoordinateTransform::new(from, to)?,
            _ => None,
        };

        let info = RasterInfo {
            no_data: Some(descriptor.no_data),
            ..base.info().clone()
        };
        let sum = Self {
            base,
            addend,
            base_transform,
            addend_transform,
            reprojection,
        };
        Ok((info, sum))
    }

    /// Addend pixel-centre coordinate of a base-grid position, if it has a
    /// full 2×2 neighbourhood inside the addend.
    fn addend_position(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        let (x, y) = match &self.reprojection {
            Some(transform) => transform.transform(x, y).ok()?,
            None => (x, y),
        };
        let (column, row) = self.addend_transform.geo_to_pixel_center(x, y);
        let (width, height) = self.addend.size();
        let inside = column >= 0.0
            && row >= 0.0
            && column + 1.0 < width as f64
            && row + 1.0 < height as f64;
        inside.then_some((column, row))
    }

    pub(crate) fn read(
        &mut self,
        info: &RasterInfo,
        x: usize,
        y: usize,
        width: usize,
        height: usize,
    ) -> Result<Vec<f64>> {
        let no_data = info.no_data.unwrap_or(MOSAIC_NO_DATA);
        let base = self.base.read_block(x, y, width, height)?;

        let mut positions = Vec::with_capacity(width * height);
        let (mut min_col, mut min_row) = (usize::MAX, usize::MAX);
        let (mut max_col, mut max_row) = (0, 0);
        for row in 0..height {
            for col in 0..width {
                let (gx, gy) = self
                    .base_transform
                    .pixel_to_geo((x + col) as f64 + 0.5, (y + row) as f64 + 0.5);
                let position = self.addend_position(gx, gy);
                if let Some((ax, ay)) = position {
                    let (ix, iy) = (ax.floor() as usize, ay.floor() as usize);
                    min_col = min_col.min(ix);
                    min_row = min_row.min(iy);
                    max_col = max_col.max(ix);
                    max_row = max_row.max(iy);
                }
                positions.push(position);
            }
        }
        if min_col == usize::MAX {
            return Ok(vec![no_data; width * height]);
        }

        let block_width = max_col - min_col + 2;
        let block_height = max_row - min_row + 2;
        let addend = self
            .addend
            .read_block(min_col, min_row, block_width, block_height)?;

        let out = base
            .into_iter()
            .zip(positions)
            .map(|(value, position)| {
                if self.base.info().is_no_data(value) {
                    return no_data;
                }
                let Some((ax, ay)) = position else {
                    return no_data;
                };
                let (ix, iy) = (ax.floor() as usize, ay.floor() as usize);
                let i = (iy - min_row) * block_width + (ix - min_col);
                let v = [
                    addend[i],
                    addend[i + 1],
                    addend[i + block_width],
                    addend[i + block_width + 1],
                ];
                if v.iter().any(|&s| self.addend.info().is_no_data(s)) {
                    return no_data;
                }
                value + bilinear(v, ax - ix as f64, ay - iy as f64)
            })
            .collect();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::super::geotiff::test_support::write_geotiff;
    use super::*;
    use tempfile::TempDir;

    fn tile(dir: &Path, name: &str, origin: (f64, f64), value: f32, no_data: Option<f64>) -> PathBuf {
        let path = dir.join(name);
        write_geotiff(
            &path,
            2,
            2,
            &[value; 4],
            [origin.0, 1.0, 0.0, origin.1, 0.0, -1.0],
            Some(4326),
            no_data,
        );
        path
    }

    #[test]
    fn test_mosaic_union_extent() {
        let dir = TempDir::new().unwrap();
        let driver = RasterDriver::default();
        let west = driver.open(tile(dir.path(), "w.tif", (0.0, 2.0), 1.0, None)).unwrap();
        let east = driver.open(tile(dir.path(), "e.tif", (2.0, 4.0), 2.0, None)).unwrap();

        let dest = dir.path().join("mosaic.json");
        driver.build_mosaic(&[&west, &east], &dest).unwrap();
        let mut mosaic = driver.open(&dest).unwrap();

        assert_eq!(mosaic.size(), (4, 4));
        assert_eq!(
            mosaic.info().geo_transform,
            Some(GeoTransform([0.0, 1.0, 0.0, 4.0, 0.0, -1.0]))
        );
        assert_eq!(mosaic.info().no_data, Some(MOSAIC_NO_DATA));

        let all = mosaic.read_block(0, 0, 4, 4).unwrap();
        let gap = MOSAIC_NO_DATA;
        #[rustfmt::skip]
        let expected = vec![
            gap, gap, 2.0, 2.0,
            gap, gap, 2.0, 2.0,
            1.0, 1.0, gap, gap,
            1.0, 1.0, gap, gap,
        ];
        assert_eq!(all, expected);
    }

    #[test]
    fn test_mosaic_later_sources_paint_over() {
        let dir = TempDir::new().unwrap();
        let driver = RasterDriver::default();
        let below = driver.open(tile(dir.path(), "a.tif", (0.0, 2.0), 1.0, Some(-1.0))).unwrap();
        let holes = dir.path().join("b.tif");
        write_geotiff(
            &holes,
            2,
            2,
            &[5.0, -1.0, -1.0, 5.0],
            [0.0, 1.0, 0.0, 2.0, 0.0, -1.0],
            Some(4326),
            Some(-1.0),
        );
        let above = driver.open(&holes).unwrap();

        let dest = dir.path().join("mosaic.json");
        driver.build_mosaic(&[&below, &above], &dest).unwrap();
        let mut mosaic = driver.open(&dest).unwrap();
        assert_eq!(mosaic.read_block(0, 0, 2, 2).unwrap(), vec![5.0, 1.0, 1.0, 5.0]);
    }

    #[test]
    fn test_mosaic_reads_tiles_through_cache() {
        let dir = TempDir::new().unwrap();
        let driver = RasterDriver::new(10);
        let west = driver.open(tile(dir.path(), "w.tif", (0.0, 2.0), 1.0, None)).unwrap();
        let east = driver.open(tile(dir.path(), "e.tif", (2.0, 2.0), 2.0, None)).unwrap();
        assert_eq!(driver.cache_stats().miss_count, 2);

        let dest = dir.path().join("mosaic.json");
        driver.build_mosaic(&[&west, &east], &dest).unwrap();
        let mut mosaics: Vec<_> = (0..4).map(|_| driver.open(&dest).unwrap()).collect();
        assert_eq!(driver.cache_stats().miss_count, 2);
        assert_eq!(driver.cache_stats().hit_count, 0);

        assert_eq!(mosaics[0].read_block(1, 0, 2, 1).unwrap(), vec![1.0, 2.0]);
        assert_eq!(driver.cache_stats().miss_count, 2);

        // Evicted tiles are decoded again on demand
        driver.clear_cache();
        assert_eq!(mosaics[3].read_block(1, 0, 2, 1).unwrap(), vec![1.0, 2.0]);
        assert_eq!(driver.cache_stats().miss_count, 4);
    }

    #[test]
    fn test_mosaic_rejects_mixed_resolution() {
        let dir = TempDir::new().unwrap();
        let driver = RasterDriver::default();
        let coarse = driver.open(tile(dir.path(), "a.tif", (0.0, 2.0), 1.0, None)).unwrap();
        let fine_path = dir.path().join("b.tif");
        write_geotiff(
            &fine_path,
            2,
            2,
            &[1.0; 4],
            [0.0, 0.5, 0.0, 2.0, 0.0, -0.5],
            Some(4326),
            None,
        );
        let fine = driver.open(&fine_path).unwrap();

        let result = driver.build_mosaic(&[&coarse, &fine], &dir.path().join("m.json"));
        assert!(matches!(result, Err(DemError::IncompatibleSources { .. })));
    }

    #[test]
    fn test_mosaic_requires_sources() {
        let dir = TempDir::new().unwrap();
        let driver = RasterDriver::default();
        let result = driver.build_mosaic(&[], &dir.path().join("m.json"));
        assert!(matches!(result, Err(DemError::EmptyMosaic)));
    }

    #[test]
    fn test_sum_composite_adds_resampled_addend() {
        let dir = TempDir::new().unwrap();
        let driver = RasterDriver::default();
        let dem_path = dir.path().join("dem.tif");
        write_geotiff(
            &dem_path,
            4,
            4,
            &[100.0; 16],
            [0.0, 1.0, 0.0, 4.0, 0.0, -1.0],
            Some(4326),
            Some(-9999.0),
        );
        // Coarser geoid grid covering a wider area
        let geoid_path = dir.path().join("geoid.tif");
        write_geotiff(
            &geoid_path,
            4,
            4,
            &[20.0; 16],
            [-2.0, 2.0, 0.0, 6.0, 0.0, -2.0],
            Some(4326),
            None,
        );

        let dem = driver.open(&dem_path).unwrap();
        let geoid = driver.open(&geoid_path).unwrap();
        let dest = dir.path().join("shifted.json");
        driver.build_sum_composite(&dem, &geoid, &dest).unwrap();

        let mut shifted = driver.open(&dest).unwrap();
        assert_eq!(shifted.size(), (4, 4));
        assert_eq!(shifted.info().geo_transform, dem.info().geo_transform);
        assert_eq!(shifted.info().no_data, Some(-9999.0));
        for value in shifted.read_block(0, 0, 4, 4).unwrap() {
            assert!((value - 120.0).abs() < 1e-9, "value = {value}");
        }
    }

    #[test]
    fn test_sum_composite_outside_addend_is_no_data() {
        let dir = TempDir::new().unwrap();
        let driver = RasterDriver::default();
        let dem = driver.open(tile(dir.path(), "dem.tif", (0.0, 2.0), 50.0, Some(-9999.0))).unwrap();
        let geoid = driver.open(tile(dir.path(), "geoid.tif", (10.0, 12.0), 20.0, None)).unwrap();

        let dest = dir.path().join("shifted.json");
        driver.build_sum_composite(&dem, &geoid, &dest).unwrap();
        let mut shifted = driver.open(&dest).unwrap();
        assert_eq!(shifted.read_block(0, 0, 2, 2).unwrap(), vec![-9999.0; 4]);
    }
}
