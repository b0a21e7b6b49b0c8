//! Fixture writers shared by the integration tests.

#![allow(dead_code)]

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tiff::encoder::{colortype, TiffEncoder};
use tiff::tags::Tag;
use tracing_subscriber::fmt::MakeWriter;

/// SRTM3 edge length in samples.
pub const SRTM3_SAMPLES: usize = 1201;

/// Origin (0, 0), 1° pixels, rows growing with latitude.
pub const UNIT_GRID: [f64; 6] = [0.0, 1.0, 0.0, 0.0, 0.0, 1.0];

/// Write a single-band `f32` GeoTIFF. `epsg` 4326 is written as a
/// geographic reference, anything else as a projected one.
pub fn write_geotiff(
    path: &Path,
    width: u32,
    height: u32,
    data: &[f32],
    gt: [f64; 6],
    epsg: Option<u16>,
    no_data: Option<f64>,
) {
    let file = BufWriter::new(File::create(path).unwrap());
    let mut encoder = TiffEncoder::new(file).unwrap();
    let mut image = encoder
        .new_image::<colortype::Gray32Float>(width, height)
        .unwrap();
    {
        let dir = image.encoder();
        dir.write_tag(Tag::from_u16_exhaustive(33550), &[gt[1], -gt[5], 0.0][..])
            .unwrap();
        dir.write_tag(
            Tag::from_u16_exhaustive(33922),
            &[0.0, 0.0, 0.0, gt[0], gt[3], 0.0][..],
        )
        .unwrap();
        if let Some(code) = epsg {
            let key = if code == 4326 { 2048 } else { 3072 };
            dir.write_tag(
                Tag::from_u16_exhaustive(34735),
                &[1u16, 1, 0, 1, key, 0, 1, code][..],
            )
            .unwrap();
        }
        if let Some(value) = no_data {
            dir.write_tag(Tag::from_u16_exhaustive(42113), value.to_string().as_str())
                .unwrap();
        }
    }
    image.write_data(data).unwrap();
}

/// Write a 4×4 WGS84 tile on [`UNIT_GRID`] with no-data -9999.
pub fn write_unit_tile(dir: &Path, name: &str, values: [f32; 16]) -> PathBuf {
    let path = dir.join(name);
    write_geotiff(&path, 4, 4, &values, UNIT_GRID, Some(4326), Some(-9999.0));
    path
}

/// Write a plain TIFF without any georeferencing.
pub fn write_plain_tiff(path: &Path, width: u32, height: u32) {
    let file = BufWriter::new(File::create(path).unwrap());
    let mut encoder = TiffEncoder::new(file).unwrap();
    let data = vec![1u16; (width * height) as usize];
    encoder
        .write_image::<colortype::Gray16>(width, height, &data)
        .unwrap();
}

/// SRTM3 tile bytes where every sample is `elevation`, except `overrides`
/// given as `((row, col), value)`.
pub fn srtm3_bytes(elevation: i16, overrides: &[((usize, usize), i16)]) -> Vec<u8> {
    let mut samples = vec![elevation; SRTM3_SAMPLES * SRTM3_SAMPLES];
    for &((row, col), value) in overrides {
        samples[row * SRTM3_SAMPLES + col] = value;
    }
    samples.iter().flat_map(|s| s.to_be_bytes()).collect()
}

/// Write an SRTM3 `.hgt` tile named `name` into `dir`.
pub fn write_hgt(dir: &Path, name: &str, elevation: i16, overrides: &[((usize, usize), i16)]) -> PathBuf {
    let path = dir.join(name);
    let mut file = File::create(&path).unwrap();
    file.write_all(&srtm3_bytes(elevation, overrides)).unwrap();
    path
}

/// Write an SRTM3 tile zipped as `<name>.zip`.
pub fn write_hgt_zip(dir: &Path, name: &str, elevation: i16) -> PathBuf {
    let path = dir.join(format!("{name}.zip"));
    let mut zip = zip::ZipWriter::new(File::create(&path).unwrap());
    zip.start_file(name, zip::write::SimpleFileOptions::default())
        .unwrap();
    zip.write_all(&srtm3_bytes(elevation, &[])).unwrap();
    zip.finish().unwrap();
    path
}

/// In-memory sink for formatted log lines.
#[derive(Clone, Default)]
pub struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = LogBuffer;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Run `f` with every log event on this thread captured, returning its
/// result and the formatted log.
pub fn capture_logs<R>(f: impl FnOnce() -> R) -> (R, String) {
    let buffer = LogBuffer::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(buffer.clone())
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .finish();
    let result = tracing::subscriber::with_default(subscriber, f);
    (result, buffer.contents())
}
