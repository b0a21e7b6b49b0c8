//! Basic example demonstrating demkit usage.
//!
//! Run with: cargo run --example basic -- /path/to/dem/dir [/path/to/geoid.tif]

use demkit::{DemError, Registry};
use std::env;

fn main() -> Result<(), DemError> {
    // Get data locations from command line
    let dem_dir = env::args().nth(1).unwrap_or_else(|| {
        eprintln!("Usage: cargo run --example basic -- /path/to/dem/dir [/path/to/geoid.tif]");
        std::process::exit(1);
    });
    let geoid = env::args().nth(2);

    let registry = Registry::new()?;
    if !registry.open_dem_directory(&dem_dir) {
        eprintln!("No DEM found in {}", dem_dir);
    }
    if let Some(geoid) = geoid {
        if !registry.open_geoid_file(&geoid) {
            eprintln!("Cannot use geoid {}", geoid);
        }
    }
    println!("Opened {} DEM file(s)", registry.dem_count());

    // Query some famous peaks
    let locations = [
        ("Mount Fuji, Japan", 138.7274, 35.3606),
        ("Mount Everest, Nepal", 86.9250, 27.9881),
        ("Denali, Alaska", -151.0074, 63.0695),
    ];

    println!("\n{:<22} {:>10} {:>10} {:>10}", "LOCATION", "MSL", "GEOID", "ELLIPSOID");
    println!("{:-<55}", "");

    let mut worker = registry.acquire();
    for (name, lon, lat) in &locations {
        let msl = worker
            .height_above_msl(*lon, *lat)
            .map(|h| format!("{:.1}", h))
            .unwrap_or_else(|| "-".to_string());
        let geoid = worker
            .geoid_height(*lon, *lat)
            .map(|h| format!("{:.1}", h))
            .unwrap_or_else(|| "-".to_string());
        let hae = worker.height_above_ellipsoid(*lon, *lat);
        println!("{:<22} {:>10} {:>10} {:>10.1}", name, msl, geoid, hae);
    }

    // Show cache statistics
    let stats = registry.cache_stats();
    println!("\nCache statistics:");
    println!("  Cached rasters: {}", stats.entry_count);
    println!("  Hits: {}", stats.hit_count);
    println!("  Misses: {}", stats.miss_count);
    println!("  Hit rate: {:.1}%", stats.hit_rate() * 100.0);

    Ok(())
}
