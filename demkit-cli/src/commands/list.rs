use anyhow::{bail, Result};
use demkit::raster::is_raster_path;
use demkit::registry::dem_files_in;
use demkit::RasterDriver;
use std::path::PathBuf;

use crate::RegistryArgs;

pub fn run(args: &RegistryArgs, dir: Option<PathBuf>) -> Result<()> {
    let dirs = match dir {
        Some(dir) => vec![dir],
        None if !args.dem_dirs.is_empty() => args.dem_dirs.clone(),
        None => bail!("No directory given. Pass one, use --dem-dir or set DEMKIT_DEM_DIR"),
    };

    let driver = RasterDriver::new(1);
    let mut usable = 0;
    let mut unreferenced = 0;
    let mut unreadable = 0;
    let mut total_size: u64 = 0;

    for dir in &dirs {
        if !dir.exists() {
            bail!("Directory does not exist: {}", dir.display());
        }

        let rasters: Vec<_> = dem_files_in(dir)
            .into_iter()
            .filter(|path| is_raster_path(path))
            .collect();
        if rasters.is_empty() {
            println!("No rasters found in: {}", dir.display());
            continue;
        }

        println!("{}", dir.display());
        println!("{:<40} {:>12} {:>12} {:>10}", "RASTER", "SIZE", "SRS", "STATUS");
        println!("{}", "-".repeat(77));

        for path in &rasters {
            total_size += std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
            let name = path
                .strip_prefix(dir)
                .unwrap_or(path)
                .display()
                .to_string();

            match driver.open(path) {
                Ok(raster) => {
                    let info = raster.info();
                    let size = format!("{}x{}", info.width, info.height);
                    let srs = info
                        .spatial_ref
                        .as_ref()
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "-".to_string());
                    let status = if info.geo_transform.is_some() {
                        usable += 1;
                        "ok"
                    } else {
                        unreferenced += 1;
                        "no georef"
                    };
                    println!("{:<40} {:>12} {:>12} {:>10}", name, size, srs, status);
                }
                Err(e) => {
                    unreadable += 1;
                    tracing::debug!(path = %path.display(), error = %e, "Cannot open raster");
                    println!("{:<40} {:>12} {:>12} {:>10}", name, "-", "-", "unreadable");
                }
            }
            driver.clear_cache();
        }
        println!();
    }

    // Summary
    println!("Summary:");
    println!("  Usable DEMs: {}", usable);
    if unreferenced > 0 {
        println!("  Not georeferenced: {}", unreferenced);
    }
    if unreadable > 0 {
        println!("  Unreadable: {}", unreadable);
    }
    println!("  Total size: {}", format_size(total_size));

    Ok(())
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
