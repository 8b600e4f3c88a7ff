//! Web Mercator projection at the maximum tile resolution.
//!
//! World coordinates are unsigned 32-bit pairs: the position of a point
//! within the full map at zoom level 32, following the slippy-map tiling
//! scheme. Every coordinate stored anywhere in a store passes through
//! [`project`] exactly once, at ingest time.

use geo::Point;
use std::f64::consts::PI;

/// Latitudes at or beyond the Mercator singularity cutoff are rejected.
pub const MAX_LATITUDE: f64 = 85.0511;

const WORLD: f64 = 4_294_967_296.0; // 2^32

/// Project a lon/lat point (degrees) to zoom-32 world coordinates.
///
/// Returns `None` for coordinates outside the projectable range: latitude
/// must lie strictly within (-85.0511, 85.0511) and longitude strictly
/// within (-180, 180). Out-of-range input is rejected, never clamped.
pub fn project(point: &Point) -> Option<(u32, u32)> {
    let lon = point.x();
    let lat = point.y();

    if !lon.is_finite() || !lat.is_finite() {
        return None;
    }
    if lat <= -MAX_LATITUDE || lat >= MAX_LATITUDE {
        return None;
    }
    if lon <= -180.0 || lon >= 180.0 {
        return None;
    }

    let lat_rad = lat.to_radians();

    let x = WORLD * ((lon + 180.0) / 360.0);
    let y = WORLD * (1.0 - ((lat_rad.tan() + 1.0 / lat_rad.cos()).ln() / PI)) / 2.0;

    Some((x as u32, y as u32))
}

/// Inverse of [`project`]: world coordinates back to a lon/lat point.
///
/// Exact up to the quantization introduced by projection; `project` then
/// `unproject` then `project` is stable.
pub fn unproject(wx: u32, wy: u32) -> Point {
    let lon = wx as f64 / WORLD * 360.0 - 180.0;
    let lat = (PI * (1.0 - 2.0 * wy as f64 / WORLD)).sinh().atan().to_degrees();

    Point::new(lon, lat)
}

/// Tile address containing a world coordinate at zoom `z`.
pub fn tile_for(wx: u32, wy: u32, z: u32) -> (u32, u32) {
    debug_assert!(z <= 32);
    (
        ((wx as u64) >> (32 - z as u64)) as u32,
        ((wy as u64) >> (32 - z as u64)) as u32,
    )
}
