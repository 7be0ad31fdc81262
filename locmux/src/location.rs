//! Location fix value object.

use crate::geo;
use crate::time;
use std::fmt;

/// A single location fix as reported by a provider.
///
/// Locations are plain owned values; the multiplexer hands out clones on
/// every delivery and cache read, so no consumer can mutate another
/// consumer's view or a cached entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Location {
    /// Name of the provider that produced the fix.
    pub provider: String,
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
    /// Estimated horizontal accuracy radius in meters, if known.
    pub accuracy_m: Option<f32>,
    /// Altitude above the WGS84 ellipsoid in meters, if known.
    pub altitude_m: Option<f64>,
    /// Ground speed in meters per second, if known.
    pub speed_mps: Option<f32>,
    /// Bearing in degrees, if known.
    pub bearing_deg: Option<f32>,
    /// Wall-clock timestamp in unix milliseconds.
    pub time_ms: u64,
    /// Monotonic timestamp in nanoseconds.
    pub elapsed_realtime_nanos: u64,
    /// Whether the fix came from a mock provider.
    pub from_mock: bool,
}

impl Location {
    /// Create a fix at the given position, stamped with the current clocks.
    pub fn new(provider: impl Into<String>, latitude: f64, longitude: f64) -> Self {
        Self {
            provider: provider.into(),
            latitude,
            longitude,
            accuracy_m: None,
            altitude_m: None,
            speed_mps: None,
            bearing_deg: None,
            time_ms: time::wall_clock_millis(),
            elapsed_realtime_nanos: time::elapsed_realtime_nanos(),
            from_mock: false,
        }
    }

    pub fn with_accuracy(mut self, accuracy_m: f32) -> Self {
        self.accuracy_m = Some(accuracy_m);
        self
    }

    pub fn with_altitude(mut self, altitude_m: f64) -> Self {
        self.altitude_m = Some(altitude_m);
        self
    }

    pub fn with_speed(mut self, speed_mps: f32) -> Self {
        self.speed_mps = Some(speed_mps);
        self
    }

    pub fn with_bearing(mut self, bearing_deg: f32) -> Self {
        self.bearing_deg = Some(bearing_deg);
        self
    }

    pub fn with_elapsed_realtime_millis(mut self, elapsed_ms: u64) -> Self {
        self.elapsed_realtime_nanos = elapsed_ms * 1_000_000;
        self
    }

    pub fn with_mock(mut self, from_mock: bool) -> Self {
        self.from_mock = from_mock;
        self
    }

    /// Monotonic timestamp in milliseconds.
    pub fn elapsed_realtime_millis(&self) -> u64 {
        self.elapsed_realtime_nanos / 1_000_000
    }

    /// Age of the fix on the monotonic clock, in milliseconds.
    pub fn age_millis(&self) -> u64 {
        time::elapsed_realtime_millis().saturating_sub(self.elapsed_realtime_millis())
    }

    /// A fix is complete when it has a provider, a plausible position, an
    /// accuracy estimate, and both timestamps. Incomplete fixes are dropped
    /// at the multiplexer boundary.
    pub fn is_complete(&self) -> bool {
        !self.provider.is_empty()
            && geo::is_valid_position(self.latitude, self.longitude)
            && self.accuracy_m.is_some()
            && self.time_ms > 0
            && self.elapsed_realtime_nanos > 0
    }

    /// Great-circle distance to another fix, in meters.
    pub fn distance_to(&self, other: &Location) -> f64 {
        geo::distance_meters(
            (self.latitude, self.longitude),
            (other.latitude, other.longitude),
        )
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:.6},{:.6}",
            self.provider, self.latitude, self.longitude
        )?;
        if let Some(acc) = self.accuracy_m {
            write!(f, " ±{:.0}m", acc)?;
        }
        if self.from_mock {
            write!(f, " [mock]")?;
        }
        Ok(())
    }
}
