use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use demkit::{Registry, RegistryBuilder};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

#[cfg(windows)]
const PATH_LIST_SEPARATOR: char = ';';
#[cfg(not(windows))]
const PATH_LIST_SEPARATOR: char = ':';

/// DEM and geoid elevation query tool
#[derive(Parser)]
#[command(name = "demkit")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    registry: RegistryArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Options shared by every command that opens elevation data.
#[derive(Args, Debug)]
pub struct RegistryArgs {
    /// Directory searched recursively for DEM tiles (repeatable)
    #[arg(
        short = 'd',
        long = "dem-dir",
        env = "DEMKIT_DEM_DIR",
        value_delimiter = PATH_LIST_SEPARATOR,
        global = true
    )]
    pub dem_dirs: Vec<PathBuf>,

    /// Single DEM file (repeatable)
    #[arg(
        short = 'f',
        long = "dem-file",
        env = "DEMKIT_DEM_FILE",
        value_delimiter = PATH_LIST_SEPARATOR,
        global = true
    )]
    pub dem_files: Vec<PathBuf>,

    /// Geoid raster
    #[arg(short, long, env = "DEMKIT_GEOID_FILE", global = true)]
    pub geoid: Option<PathBuf>,

    /// Height above ellipsoid where neither DEM nor geoid has data
    #[arg(
        long,
        env = "DEMKIT_DEFAULT_HEIGHT",
        default_value = "0",
        allow_negative_numbers = true,
        global = true
    )]
    pub default_height: f64,

    /// Edge of each worker's read window, in pixels
    #[arg(long, env = "DEMKIT_WINDOW_SIZE", default_value = "64", global = true)]
    pub window_size: usize,

    /// Maximum decoded rasters in cache
    #[arg(
        short,
        long,
        env = "DEMKIT_CACHE_SIZE",
        default_value = "100",
        global = true
    )]
    pub cache_size: u64,
}

impl RegistryArgs {
    /// Build a registry from the options.
    pub fn open(&self) -> Result<Registry> {
        let mut builder = RegistryBuilder::new()
            .default_height(self.default_height)
            .window_size(self.window_size)
            .cache_size(self.cache_size);
        for dir in &self.dem_dirs {
            builder = builder.dem_directory(dir);
        }
        for file in &self.dem_files {
            builder = builder.dem_file(file);
        }
        if let Some(geoid) = &self.geoid {
            builder = builder.geoid_file(geoid);
        }

        let registry = builder.build().context("Failed to open elevation data")?;
        if registry.dem_count() == 0 {
            tracing::warn!("No DEM configured. Use --dem-dir, --dem-file or DEMKIT_DEM_DIR");
        }
        Ok(registry)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Query heights for a single coordinate
    Query {
        /// Longitude in decimal degrees
        #[arg(long, allow_negative_numbers = true)]
        lon: f64,

        /// Latitude in decimal degrees
        #[arg(long, allow_negative_numbers = true)]
        lat: f64,

        /// Output result as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Add heights to every row of a CSV file
    Batch {
        /// Input CSV file
        input: PathBuf,

        /// Output file (defaults to <input>_elevation.csv)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Column name for latitude
        #[arg(long, default_value = "lat")]
        lat_col: String,

        /// Column name for longitude
        #[arg(long, default_value = "lon")]
        lon_col: String,

        /// Worker threads (defaults to available parallelism)
        #[arg(short, long)]
        threads: Option<usize>,
    },

    /// Display information about a raster
    Info {
        /// Path to a raster file
        #[arg(required_unless_present_all = ["lat", "lon"])]
        raster: Option<PathBuf>,

        /// Find the SRTM tile covering this latitude in the DEM directories
        #[arg(long, conflicts_with = "raster", requires = "lon", allow_negative_numbers = true)]
        lat: Option<f64>,

        /// Find the SRTM tile covering this longitude in the DEM directories
        #[arg(long, conflicts_with = "raster", requires = "lat", allow_negative_numbers = true)]
        lon: Option<f64>,
    },

    /// List the rasters found under a directory
    List {
        /// Directory to scan (defaults to the DEM directories)
        dir: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "demkit=warn,demkit_cli=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Query { lon, lat, json } => commands::query::run(&cli.registry, lon, lat, json),
        Commands::Batch {
            input,
            output,
            lat_col,
            lon_col,
            threads,
        } => commands::batch::run(&cli.registry, input, output, lat_col, lon_col, threads),
        Commands::Info { raster, lat, lon } => commands::info::run(&cli.registry, raster, lat, lon),
        Commands::List { dir } => commands::list::run(&cli.registry, dir),
    }
}
