//! SRTM tile naming.
//!
//! `.hgt` tiles carry no georeferencing of their own: the position of a
//! 1° × 1° tile is encoded in its name as `{N|S}{lat}{E|W}{lon}.hgt`, naming
//! the **southwest corner**. Zipped tiles append `.zip` to that name.

/// Build the SRTM tile name covering a coordinate.
///
/// # Examples
///
/// ```
/// use demkit::filename::lat_lon_to_filename;
///
/// assert_eq!(lat_lon_to_filename(35.5, 138.7), "N35E138.hgt");
/// assert_eq!(lat_lon_to_filename(-12.3, -77.1), "S13W078.hgt");
/// ```
pub fn lat_lon_to_filename(lat: f64, lon: f64) -> String {
    let lat_int = lat.floor() as i32;
    let lon_int = lon.floor() as i32;

    format!(
        "{}{:02}{}{:03}.hgt",
        if lat_int >= 0 { 'N' } else { 'S' },
        lat_int.abs(),
        if lon_int >= 0 { 'E' } else { 'W' },
        lon_int.abs()
    )
}

/// Parse the southwest corner `(lat, lon)` out of a tile name.
///
/// Accepts bare names, paths (either separator), and the `.hgt` / `.hgt.zip`
/// suffixes. Returns `None` for anything that is not a tile name.
///
/// # Examples
///
/// ```
/// use demkit::filename::filename_to_lat_lon;
///
/// assert_eq!(filename_to_lat_lon("N35E138.hgt"), Some((35, 138)));
/// assert_eq!(filename_to_lat_lon("/srtm/S12W077.hgt.zip"), Some((-12, -77)));
/// assert_eq!(filename_to_lat_lon("scan.hgt"), None);
/// ```
pub fn filename_to_lat_lon(filename: &str) -> Option<(i32, i32)> {
    let name = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    let name = name.strip_suffix(".zip").unwrap_or(name);
    let name = name.strip_suffix(".hgt").unwrap_or(name);

    // N00E000
    if name.len() != 7 || !name.is_ascii() {
        return None;
    }

    let bytes = name.as_bytes();
    let lat_sign = match bytes[0] {
        b'N' | b'n' => 1,
        b'S' | b's' => -1,
        _ => return None,
    };
    let lon_sign = match bytes[3] {
        b'E' | b'e' => 1,
        b'W' | b'w' => -1,
        _ => return None,
    };
    let lat: i32 = name[1..3].parse().ok()?;
    let lon: i32 = name[4..7].parse().ok()?;

    Some((lat * lat_sign, lon * lon_sign))
}
