use anyhow::{anyhow, bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::thread;

use crate::RegistryArgs;

struct Heights {
    ellipsoid: f64,
    msl: Option<f64>,
    geoid: Option<f64>,
}

pub fn run(
    args: &RegistryArgs,
    input: PathBuf,
    output: Option<PathBuf>,
    lat_col: String,
    lon_col: String,
    threads: Option<usize>,
) -> Result<()> {
    let extension = input
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();
    if extension != "csv" {
        bail!("Unsupported file format: {}. Use .csv", extension);
    }

    let registry = args.open()?;
    let threads = threads
        .or_else(|| thread::available_parallelism().ok().map(NonZeroUsize::get))
        .unwrap_or(1)
        .max(1);

    process_csv(&registry, &input, output, &lat_col, &lon_col, threads)
}

fn process_csv(
    registry: &demkit::Registry,
    input: &Path,
    output: Option<PathBuf>,
    lat_col: &str,
    lon_col: &str,
    threads: usize,
) -> Result<()> {
    let file = File::open(input).context("Failed to open input file")?;
    let mut reader = csv::Reader::from_reader(BufReader::new(file));

    // Find column indices
    let headers = reader.headers()?.clone();
    let lat_idx = headers
        .iter()
        .position(|h| h == lat_col)
        .with_context(|| format!("Column '{}' not found in CSV", lat_col))?;
    let lon_idx = headers
        .iter()
        .position(|h| h == lon_col)
        .with_context(|| format!("Column '{}' not found in CSV", lon_col))?;

    let records: Vec<_> = reader.records().collect::<Result<_, _>>()?;
    let coords = records
        .iter()
        .enumerate()
        .map(|(line, record)| {
            let lat: f64 = record
                .get(lat_idx)
                .context("Missing latitude")?
                .parse()
                .with_context(|| format!("Invalid latitude on record {}", line + 1))?;
            let lon: f64 = record
                .get(lon_idx)
                .context("Missing longitude")?
                .parse()
                .with_context(|| format!("Invalid longitude on record {}", line + 1))?;
            Ok::<_, anyhow::Error>((lon, lat))
        })
        .collect::<Result<Vec<_>>>()?;

    let pb = ProgressBar::new(coords.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
            )?
            .progress_chars("#>-"),
    );

    // One worker per thread, each over a contiguous chunk
    let chunk_size = coords.len().div_ceil(threads).max(1);
    let heights = thread::scope(|s| -> Result<Vec<Heights>> {
        let handles: Vec<_> = coords
            .chunks(chunk_size)
            .map(|chunk| {
                let pb = pb.clone();
                s.spawn(move || {
                    let mut worker = registry.acquire();
                    chunk
                        .iter()
                        .map(|&(lon, lat)| {
                            let heights = Heights {
                                ellipsoid: worker.height_above_ellipsoid(lon, lat),
                                msl: worker.height_above_msl(lon, lat),
                                geoid: worker.geoid_height(lon, lat),
                            };
                            pb.inc(1);
                            heights
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut heights = Vec::with_capacity(coords.len());
        for handle in handles {
            heights.extend(handle.join().map_err(|_| anyhow!("Batch worker panicked"))?);
        }
        Ok(heights)
    })?;
    pb.finish_with_message("done");

    // Prepare output
    let output_path = output.unwrap_or_else(|| {
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "output".to_string());
        input.with_file_name(format!("{}_elevation.csv", stem))
    });
    let output_file = File::create(&output_path).context("Failed to create output file")?;
    let mut writer = csv::Writer::from_writer(BufWriter::new(output_file));

    let mut new_headers: Vec<&str> = headers.iter().collect();
    new_headers.extend(["hae", "msl", "geoid"]);
    writer.write_record(&new_headers)?;

    let void_or = |height: Option<f64>| {
        height
            .map(|h| format!("{:.2}", h))
            .unwrap_or_else(|| "void".to_string())
    };
    for (record, heights) in records.iter().zip(&heights) {
        let hae = format!("{:.2}", heights.ellipsoid);
        let msl = void_or(heights.msl);
        let geoid = void_or(heights.geoid);

        let mut new_record: Vec<&str> = record.iter().collect();
        new_record.extend([hae.as_str(), msl.as_str(), geoid.as_str()]);
        writer.write_record(&new_record)?;
    }
    writer.flush()?;

    println!("Output written to: {}", output_path.display());
    Ok(())
}
