//! Coarse location derivation.
//!
//! Coarsening a fine location is a two step process: add a stable random
//! offset, then snap the result to a grid sized by the configured coarse
//! accuracy. The offset hides the grid alignment; the grid hides movement
//! below the accuracy radius. Offsets persist across calls so the same fine
//! location always coarsens to the same cell, and are regenerated only by
//! [`LocationFudger::reset_offsets`].

use crate::location::Location;
use std::sync::Mutex;

/// Default coarse accuracy in meters.
pub const DEFAULT_COARSE_ACCURACY_M: f64 = 2_000.0;

const METERS_PER_DEGREE_LAT: f64 = 111_000.0;

fn mix(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

fn unit_fraction(bits: u64) -> f64 {
    (bits >> 11) as f64 / (1u64 << 53) as f64
}

struct Offsets {
    seed: u64,
    lat_m: f64,
    lon_m: f64,
}

impl Offsets {
    fn generate(seed: u64, accuracy_m: f64) -> Self {
        // offsets in (-accuracy/2, accuracy/2) on each axis
        let lat_m = (unit_fraction(mix(seed)) - 0.5) * accuracy_m;
        let lon_m = (unit_fraction(mix(seed ^ 0x5DEE_CE66)) - 0.5) * accuracy_m;
        Self { seed, lat_m, lon_m }
    }
}

/// Deterministic fine-to-coarse obfuscator.
pub struct LocationFudger {
    accuracy_m: f64,
    offsets: Mutex<Offsets>,
}

impl LocationFudger {
    pub fn new(accuracy_m: f64, seed: u64) -> Self {
        let accuracy_m = accuracy_m.max(200.0);
        Self {
            accuracy_m,
            offsets: Mutex::new(Offsets::generate(seed, accuracy_m)),
        }
    }

    pub fn accuracy_m(&self) -> f64 {
        self.accuracy_m
    }

    /// Derive a coarse location from a fine one.
    ///
    /// The result carries no altitude, speed, or bearing, and its accuracy
    /// is at least the coarse accuracy.
    pub fn create_coarse(&self, fine: &Location) -> Location {
        let offsets = self.offsets.lock().unwrap();

        let mut coarse = fine.clone();
        coarse.altitude_m = None;
        coarse.speed_mps = None;
        coarse.bearing_deg = None;

        let lat_grid_deg = self.accuracy_m / METERS_PER_DEGREE_LAT;
        let offset_lat_deg = offsets.lat_m / METERS_PER_DEGREE_LAT;
        let snapped_lat =
            ((fine.latitude + offset_lat_deg) / lat_grid_deg).round() * lat_grid_deg;
        let snapped_lat = snapped_lat.clamp(-90.0, 90.0);

        let meters_per_degree_lon =
            (METERS_PER_DEGREE_LAT * snapped_lat.to_radians().cos()).max(1.0);
        let lon_grid_deg = self.accuracy_m / meters_per_degree_lon;
        let offset_lon_deg = offsets.lon_m / meters_per_degree_lon;
        let mut snapped_lon =
            ((fine.longitude + offset_lon_deg) / lon_grid_deg).round() * lon_grid_deg;
        while snapped_lon > 180.0 {
            snapped_lon -= 360.0;
        }
        while snapped_lon < -180.0 {
            snapped_lon += 360.0;
        }

        coarse.latitude = snapped_lat;
        coarse.longitude = snapped_lon;
        coarse.accuracy_m = Some(
            fine.accuracy_m
                .map_or(self.accuracy_m as f32, |a| a.max(self.accuracy_m as f32)),
        );
        coarse
    }

    /// Regenerate the offsets, changing which grid cells fine locations
    /// land in. Called when a mock provider session ends so offsets
    /// inferred through mock locations become useless.
    pub fn reset_offsets(&self) {
        let mut offsets = self.offsets.lock().unwrap();
        let next_seed = mix(offsets.seed ^ 0xA076_1D64_78BD_642F);
        *offsets = Offsets::generate(next_seed, self.accuracy_m);
    }
}
