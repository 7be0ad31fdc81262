//! Client location requests and the merged provider request.

use std::fmt;

/// Sentinel interval for passive requests: observe deliveries without
/// contributing to the merged provider request.
pub const PASSIVE_INTERVAL: u64 = u64::MAX;

/// Sentinel interval for a merged request that asks the provider to stop.
pub const INTERVAL_DISABLED: u64 = u64::MAX;

/// Sentinel meaning "the min update interval tracks the interval", which
/// keeps the two in lockstep through coercion and throttling.
pub const IMPLICIT_MIN_UPDATE_INTERVAL: u64 = u64::MAX;

/// Fastest interval at which clients may receive coarse locations. Coarse
/// requests and the coarse last-location slots are both snapped to this
/// grid.
pub const MIN_COARSE_INTERVAL_MS: u64 = 10 * 60 * 1000;

/// Requested tradeoff between accuracy and power.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Quality {
    LowPower,
    Balanced,
    HighAccuracy,
}

/// Power attribution: the set of (uid, package) pairs a request does work
/// on behalf of.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkSource {
    entries: Vec<(u32, String)>,
}

impl WorkSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// A work source with a single (uid, package) entry.
    pub fn single(uid: u32, package: impl Into<String>) -> Self {
        Self {
            entries: vec![(uid, package.into())],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Union another work source into this one, skipping duplicates.
    pub fn add(&mut self, other: &WorkSource) {
        for entry in &other.entries {
            if !self.entries.contains(entry) {
                self.entries.push(entry.clone());
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &(u32, String)> {
        self.entries.iter()
    }
}

/// A client's request for location updates. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationRequest {
    /// Desired interval between updates in milliseconds, or
    /// [`PASSIVE_INTERVAL`].
    pub interval_ms: u64,
    /// Fastest interval the client is willing to receive updates at, or
    /// [`IMPLICIT_MIN_UPDATE_INTERVAL`] to track `interval_ms`.
    pub min_update_interval_ms: u64,
    /// Minimum displacement between updates in meters; 0 disables the check.
    pub min_update_distance_m: f32,
    /// Requested quality.
    pub quality: Quality,
    /// Maximum number of updates before the registration removes itself.
    pub max_updates: u32,
    /// Lifetime of the request in milliseconds; `u64::MAX` means unbounded.
    pub duration_ms: u64,
    /// Whether the client prefers low-power operation.
    pub low_power: bool,
    /// Privileged bypass of the user location setting and blacklist.
    pub location_settings_ignored: bool,
    /// Suppress app-op attribution for this request.
    pub hidden_from_app_ops: bool,
    /// Opt in to an immediate historical location on activation.
    pub deliver_historical: bool,
    /// Who to blame for power.
    pub work_source: WorkSource,
}

impl LocationRequest {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms,
            min_update_interval_ms: IMPLICIT_MIN_UPDATE_INTERVAL,
            min_update_distance_m: 0.0,
            quality: Quality::Balanced,
            max_updates: u32::MAX,
            duration_ms: u64::MAX,
            low_power: false,
            location_settings_ignored: false,
            hidden_from_app_ops: false,
            deliver_historical: false,
            work_source: WorkSource::new(),
        }
    }

    /// A passive request: receives whatever the provider produces for
    /// others but never drives it.
    pub fn passive() -> Self {
        Self::new(PASSIVE_INTERVAL)
    }

    pub fn with_min_update_interval(mut self, ms: u64) -> Self {
        self.min_update_interval_ms = ms;
        self
    }

    pub fn with_min_update_distance(mut self, meters: f32) -> Self {
        self.min_update_distance_m = meters;
        self
    }

    pub fn with_quality(mut self, quality: Quality) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_max_updates(mut self, max_updates: u32) -> Self {
        self.max_updates = max_updates;
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_low_power(mut self, low_power: bool) -> Self {
        self.low_power = low_power;
        self
    }

    pub fn with_location_settings_ignored(mut self, ignored: bool) -> Self {
        self.location_settings_ignored = ignored;
        self
    }

    pub fn with_hidden_from_app_ops(mut self, hidden: bool) -> Self {
        self.hidden_from_app_ops = hidden;
        self
    }

    pub fn with_deliver_historical(mut self, deliver: bool) -> Self {
        self.deliver_historical = deliver;
        self
    }

    pub fn with_work_source(mut self, work_source: WorkSource) -> Self {
        self.work_source = work_source;
        self
    }

    /// The min update interval with the implicit sentinel resolved.
    pub fn resolved_min_update_interval_ms(&self) -> u64 {
        if self.min_update_interval_ms == IMPLICIT_MIN_UPDATE_INTERVAL {
            self.interval_ms
        } else {
            self.min_update_interval_ms
        }
    }

    /// Absolute expiration on the monotonic clock for a registration made
    /// at `start_realtime_ms`.
    pub fn expiration_realtime_ms(&self, start_realtime_ms: u64) -> u64 {
        if self.duration_ms == u64::MAX {
            u64::MAX
        } else {
            start_realtime_ms.saturating_add(self.duration_ms)
        }
    }

    pub fn is_passive(&self) -> bool {
        self.interval_ms == PASSIVE_INTERVAL
    }
}

impl fmt::Display for LocationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_passive() {
            write!(f, "PASSIVE")?;
        } else {
            write!(f, "@{}ms", self.interval_ms)?;
        }
        write!(f, " {:?}", self.quality)?;
        if self.location_settings_ignored {
            write!(f, " bypass")?;
        }
        if self.max_updates != u32::MAX {
            write!(f, " max={}", self.max_updates)?;
        }
        Ok(())
    }
}

/// The merged request pushed to the provider. Value-equal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderRequest {
    /// Merged interval, or [`INTERVAL_DISABLED`] to stop the provider.
    pub interval_ms: u64,
    pub quality: Quality,
    pub low_power: bool,
    pub location_settings_ignored: bool,
    pub work_source: WorkSource,
}

impl ProviderRequest {
    /// The no-op request: tells the provider to stop producing locations.
    pub fn disabled() -> Self {
        Self {
            interval_ms: INTERVAL_DISABLED,
            quality: Quality::LowPower,
            low_power: true,
            location_settings_ignored: false,
            work_source: WorkSource::new(),
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.interval_ms == INTERVAL_DISABLED
    }
}

impl fmt::Display for ProviderRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_disabled() {
            write!(f, "DISABLED")
        } else {
            write!(f, "@{}ms {:?}", self.interval_ms, self.quality)?;
            if self.location_settings_ignored {
                write!(f, " bypass")?;
            }
            if self.low_power {
                write!(f, " lowpower")?;
            }
            Ok(())
        }
    }
}
