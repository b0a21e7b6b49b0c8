use anyhow::Result;
use serde::Serialize;

use crate::RegistryArgs;

#[derive(Serialize)]
struct HeightResponse {
    lon: f64,
    lat: f64,
    height_above_ellipsoid: f64,
    height_above_msl: Option<f64>,
    geoid_height: Option<f64>,
}

fn format_height(height: Option<f64>) -> String {
    height
        .map(|h| format!("{:.2} m", h))
        .unwrap_or_else(|| "void".to_string())
}

pub fn run(args: &RegistryArgs, lon: f64, lat: f64, json: bool) -> Result<()> {
    let registry = args.open()?;
    let mut worker = registry.acquire();

    let response = HeightResponse {
        lon,
        lat,
        height_above_ellipsoid: worker.height_above_ellipsoid(lon, lat),
        height_above_msl: worker.height_above_msl(lon, lat),
        geoid_height: worker.geoid_height(lon, lat),
    };

    if json {
        println!("{}", serde_json::to_string(&response)?);
    } else {
        println!("Height above ellipsoid: {:.2} m", response.height_above_ellipsoid);
        println!("Height above MSL:       {}", format_height(response.height_above_msl));
        println!("Geoid height:           {}", format_height(response.geoid_height));
    }

    Ok(())
}
