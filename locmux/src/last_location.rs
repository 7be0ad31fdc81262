//! Per-user last-known-location cache.
//!
//! Four slots: fine/coarse crossed with normal/bypass. The bypass slots
//! serve settings-ignored callers and survive the provider being disabled;
//! the normal slots are cleared on disable. The coarse slots advance only
//! when the candidate is at least [`MIN_COARSE_INTERVAL_MS`] newer than
//! what is stored, so repeated polling at the coarse level cannot recover
//! fine-grained movement.

use crate::location::Location;
use crate::policy::PermissionLevel;
use crate::request::MIN_COARSE_INTERVAL_MS;

#[derive(Debug, Default)]
pub struct LastLocation {
    fine: Option<Location>,
    coarse: Option<Location>,
    fine_bypass: Option<Location>,
    coarse_bypass: Option<Location>,
}

impl LastLocation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update the normal slots.
    pub fn set(&mut self, location: &Location) {
        self.fine = next_fine(self.fine.take(), location);
        self.coarse = next_coarse(self.coarse.take(), location);
    }

    /// Update the bypass slots.
    pub fn set_bypass(&mut self, location: &Location) {
        self.fine_bypass = next_fine(self.fine_bypass.take(), location);
        self.coarse_bypass = next_coarse(self.coarse_bypass.take(), location);
    }

    pub fn get(&self, level: PermissionLevel, ignore_settings: bool) -> Option<&Location> {
        match (level, ignore_settings) {
            (PermissionLevel::Fine, false) => self.fine.as_ref(),
            (PermissionLevel::Fine, true) => self.fine_bypass.as_ref(),
            (PermissionLevel::Coarse, false) => self.coarse.as_ref(),
            (PermissionLevel::Coarse, true) => self.coarse_bypass.as_ref(),
        }
    }

    /// Clear the normal slots (provider became disabled for this user).
    pub fn clear_normal(&mut self) {
        self.fine = None;
        self.coarse = None;
    }

    /// Drop any slot whose contents came from a mock provider.
    pub fn clear_mock(&mut self) {
        for slot in [
            &mut self.fine,
            &mut self.coarse,
            &mut self.fine_bypass,
            &mut self.coarse_bypass,
        ] {
            if slot.as_ref().is_some_and(|l| l.from_mock) {
                *slot = None;
            }
        }
    }
}

fn next_fine(old: Option<Location>, new: &Location) -> Option<Location> {
    match old {
        None => Some(new.clone()),
        // strictly newer wins
        Some(old) if new.elapsed_realtime_nanos > old.elapsed_realtime_nanos => Some(new.clone()),
        Some(old) => Some(old),
    }
}

fn next_coarse(old: Option<Location>, new: &Location) -> Option<Location> {
    match old {
        None => Some(new.clone()),
        // advance only along the coarse time grid
        Some(old)
            if new
                .elapsed_realtime_millis()
                .saturating_sub(MIN_COARSE_INTERVAL_MS)
                > old.elapsed_realtime_millis() =>
        {
            Some(new.clone())
        }
        Some(old) => Some(old),
    }
}
