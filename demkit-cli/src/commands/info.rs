use anyhow::{bail, Context, Result};
use demkit::filename::{filename_to_lat_lon, lat_lon_to_filename};
use demkit::raster::SrtmResolution;
use demkit::registry::dem_files_in;
use demkit::RasterDriver;
use std::path::{Path, PathBuf};

use crate::RegistryArgs;

/// Samples decoded per block while scanning for statistics.
const SCAN_BLOCK_SAMPLES: usize = 1 << 20;

pub fn run(
    args: &RegistryArgs,
    raster: Option<PathBuf>,
    lat: Option<f64>,
    lon: Option<f64>,
) -> Result<()> {
    let path = match (raster, lat, lon) {
        (Some(path), _, _) => path,
        (None, Some(lat), Some(lon)) => find_tile(&args.dem_dirs, &lat_lon_to_filename(lat, lon))?,
        _ => bail!("Give a raster path, or both --lat and --lon"),
    };

    if !path.exists() {
        bail!("Raster not found: {}", path.display());
    }

    let driver = RasterDriver::new(1);
    let mut raster = driver.open(&path).context("Failed to open raster")?;
    let info = raster.info().clone();
    let (width, height) = raster.size();

    // Min/max over valid samples, scanning in row blocks
    let (mut min_elev, mut max_elev) = (f64::INFINITY, f64::NEG_INFINITY);
    let mut no_data_count = 0u64;
    let rows_per_block = (SCAN_BLOCK_SAMPLES / width.max(1)).max(1);
    let mut row = 0;
    while row < height {
        let rows = rows_per_block.min(height - row);
        for value in raster.read_block(0, row, width, rows)? {
            if info.is_no_data(value) {
                no_data_count += 1;
            } else {
                min_elev = min_elev.min(value);
                max_elev = max_elev.max(value);
            }
        }
        row += rows;
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let lower = file_name.to_ascii_lowercase();

    println!("Raster: {}", file_name);
    println!("Path: {}", path.display());
    println!();
    if lower.ends_with(".hgt") || lower.ends_with(".hgt.zip") {
        let resolution_str = match SrtmResolution::from_len(width * height * 2) {
            Ok(SrtmResolution::Srtm1) => "SRTM1 (~30m)",
            Ok(SrtmResolution::Srtm3) => "SRTM3 (~90m)",
            Err(_) => "unknown",
        };
        println!("Resolution: {}", resolution_str);
    }
    println!("Size: {}x{} samples", width, height);

    if let Some((base_lat, base_lon)) = filename_to_lat_lon(&file_name) {
        println!(
            "Coverage: {}{}-{}{}, {}{}-{}{}",
            if base_lat >= 0 { "N" } else { "S" },
            base_lat.abs(),
            if base_lat + 1 >= 0 { "N" } else { "S" },
            (base_lat + 1).abs(),
            if base_lon >= 0 { "E" } else { "W" },
            base_lon.abs(),
            if base_lon + 1 >= 0 { "E" } else { "W" },
            (base_lon + 1).abs()
        );
    }

    match &info.geo_transform {
        Some(gt) => {
            let (x, y) = gt.origin();
            let (dx, dy) = gt.pixel_size();
            println!("Origin: ({}, {})", x, y);
            println!("Pixel size: ({}, {})", dx, dy);
            if !gt.is_axis_aligned() {
                println!("Rotation: ({}, {})", gt.0[2], gt.0[4]);
            }
        }
        None => println!("Geotransform: none (not usable as a DEM)"),
    }
    match &info.spatial_ref {
        Some(srs) => println!("Spatial reference: {}", srs),
        None => println!("Spatial reference: none"),
    }
    match info.no_data {
        Some(value) => println!("No-data value: {}", value),
        None => println!("No-data value: none"),
    }
    if let Ok(metadata) = std::fs::metadata(&path) {
        println!("File size: {}", format_size(metadata.len()));
    }
    println!();

    if min_elev <= max_elev {
        println!("Min elevation: {}m", min_elev);
        println!("Max elevation: {}m", max_elev);
    }

    let total_samples = (width * height) as u64;
    if no_data_count > 0 {
        let pct = (no_data_count as f64 / total_samples as f64) * 100.0;
        println!("No-data samples: {} ({:.1}%)", no_data_count, pct);
    }

    Ok(())
}

/// Find `filename` (plain or zipped) under the DEM directories.
fn find_tile(dirs: &[PathBuf], filename: &str) -> Result<PathBuf> {
    if dirs.is_empty() {
        bail!("No DEM directory given. Use --dem-dir or set DEMKIT_DEM_DIR");
    }
    let zipped = format!("{}.zip", filename);
    dirs.iter()
        .flat_map(|dir| dem_files_in(dir))
        .find(|path| matches_name(path, filename) || matches_name(path, &zipped))
        .with_context(|| format!("Tile {} not found in the DEM directories", filename))
}

fn matches_name(path: &Path, name: &str) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.eq_ignore_ascii_case(name))
}

fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}
