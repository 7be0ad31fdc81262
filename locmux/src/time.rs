//! Monotonic clock helpers.
//!
//! All scheduling math in this crate runs on "elapsed realtime": a monotonic
//! millisecond clock that never goes backwards and is unaffected by wall-clock
//! adjustments. Wall-clock timestamps are only used for human-facing records
//! (the event log).

use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

// The monotonic epoch starts well before any observable timestamp so that
// ages of locations created shortly after startup stay representable.
const STARTUP_OFFSET_MS: u64 = 24 * 60 * 60 * 1000;

static CLOCK_EPOCH: OnceLock<Instant> = OnceLock::new();

fn clock_epoch() -> Instant {
    *CLOCK_EPOCH.get_or_init(Instant::now)
}

/// Milliseconds on the monotonic realtime clock.
pub fn elapsed_realtime_millis() -> u64 {
    STARTUP_OFFSET_MS + clock_epoch().elapsed().as_millis() as u64
}

/// Nanoseconds on the monotonic realtime clock.
pub fn elapsed_realtime_nanos() -> u64 {
    STARTUP_OFFSET_MS * 1_000_000 + clock_epoch().elapsed().as_nanos() as u64
}

/// Current wall-clock time as milliseconds since the unix epoch.
pub fn wall_clock_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
