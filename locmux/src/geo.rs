//! Geodesic helpers for position values.

use std::f64::consts::PI;

/// Mean earth radius in meters.
const EARTH_RADIUS_M: f64 = 6_371_000.0;

const DEG_TO_RAD: f64 = PI / 180.0;

/// Valid latitude range in degrees.
pub const MIN_LAT: f64 = -90.0;
pub const MAX_LAT: f64 = 90.0;

/// Valid longitude range in degrees.
pub const MIN_LON: f64 = -180.0;
pub const MAX_LON: f64 = 180.0;

/// Check whether a (latitude, longitude) pair is a plausible position.
pub fn is_valid_position(lat: f64, lon: f64) -> bool {
    lat.is_finite()
        && lon.is_finite()
        && (MIN_LAT..=MAX_LAT).contains(&lat)
        && (MIN_LON..=MAX_LON).contains(&lon)
}

/// Great-circle distance between two positions in meters.
///
/// Uses the haversine formula for accuracy over short distances.
///
/// # Arguments
///
/// * `from` - First position as (latitude, longitude) in degrees
/// * `to` - Second position as (latitude, longitude) in degrees
pub fn distance_meters(from: (f64, f64), to: (f64, f64)) -> f64 {
    let (lat1, lon1) = from;
    let (lat2, lon2) = to;

    let lat1_rad = lat1 * DEG_TO_RAD;
    let lat2_rad = lat2 * DEG_TO_RAD;
    let delta_lat = (lat2 - lat1) * DEG_TO_RAD;
    let delta_lon = (lon2 - lon1) * DEG_TO_RAD;

    // Haversine formula
    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();

    EARTH_RADIUS_M * c
}
