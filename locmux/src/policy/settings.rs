//! User and global location settings.

use super::{ListenerId, Listeners};
use crate::config::DEFAULT_BACKGROUND_THROTTLE_INTERVAL_MS;
use crate::fudger::DEFAULT_COARSE_ACCURACY_M;
use crate::identity::UserId;
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Observer for settings changes the multiplexer reacts to. Default
/// methods let implementations pick the events they care about.
pub trait SettingsListener: Send + Sync {
    fn on_location_enabled_changed(&self, _user_id: UserId) {}
    fn on_background_throttle_interval_changed(&self) {}
    fn on_background_throttle_whitelist_changed(&self) {}
    fn on_ignore_settings_whitelist_changed(&self) {}
    fn on_blacklist_changed(&self, _user_id: UserId) {}
}

/// Read access to location settings plus change subscription.
pub trait SettingsHelper: Send + Sync {
    /// Whether the user-facing location master switch is on.
    fn is_location_enabled(&self, user_id: UserId) -> bool;

    /// Interval forced on background clients.
    fn background_throttle_interval_ms(&self) -> u64;

    /// Whether the package is blocked from location for this user.
    fn is_package_blacklisted(&self, user_id: UserId, package: &str) -> bool;

    /// Whether the package is exempt from background throttling.
    fn is_background_throttle_exempt(&self, package: &str) -> bool;

    /// Whether the package may use the settings-ignored bypass.
    fn is_ignore_settings_allowed(&self, package: &str) -> bool;

    /// Coarse location accuracy in meters.
    fn coarse_accuracy_m(&self) -> f64;

    fn add_listener(&self, listener: Arc<dyn SettingsListener>) -> ListenerId;

    fn remove_listener(&self, id: ListenerId);
}

/// Concurrent in-memory settings store.
///
/// Location is enabled by default for every user; everything else starts
/// empty. Mutators notify subscribed listeners synchronously.
pub struct InMemorySettings {
    location_disabled: DashSet<UserId>,
    background_throttle_interval_ms: AtomicU64,
    blacklist: DashMap<UserId, DashSet<String>>,
    throttle_whitelist: DashSet<String>,
    ignore_settings_whitelist: DashSet<String>,
    coarse_accuracy_m: Mutex<f64>,
    listeners: Listeners<dyn SettingsListener>,
}

impl Default for InMemorySettings {
    fn default() -> Self {
        Self {
            location_disabled: DashSet::new(),
            background_throttle_interval_ms: AtomicU64::new(
                DEFAULT_BACKGROUND_THROTTLE_INTERVAL_MS,
            ),
            blacklist: DashMap::new(),
            throttle_whitelist: DashSet::new(),
            ignore_settings_whitelist: DashSet::new(),
            coarse_accuracy_m: Mutex::new(DEFAULT_COARSE_ACCURACY_M),
            listeners: Listeners::default(),
        }
    }
}

impl InMemorySettings {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_location_enabled(&self, user_id: UserId, enabled: bool) {
        let changed = if enabled {
            self.location_disabled.remove(&user_id).is_some()
        } else {
            self.location_disabled.insert(user_id)
        };
        if changed {
            for listener in self.listeners.snapshot() {
                listener.on_location_enabled_changed(user_id);
            }
        }
    }

    pub fn set_background_throttle_interval_ms(&self, interval_ms: u64) {
        self.background_throttle_interval_ms
            .store(interval_ms, Ordering::Relaxed);
        for listener in self.listeners.snapshot() {
            listener.on_background_throttle_interval_changed();
        }
    }

    pub fn set_package_blacklisted(&self, user_id: UserId, package: &str, blacklisted: bool) {
        let entry = self.blacklist.entry(user_id).or_default();
        if blacklisted {
            entry.insert(package.to_string());
        } else {
            entry.remove(package);
        }
        drop(entry);
        for listener in self.listeners.snapshot() {
            listener.on_blacklist_changed(user_id);
        }
    }

    pub fn set_background_throttle_exempt(&self, package: &str, exempt: bool) {
        if exempt {
            self.throttle_whitelist.insert(package.to_string());
        } else {
            self.throttle_whitelist.remove(package);
        }
        for listener in self.listeners.snapshot() {
            listener.on_background_throttle_whitelist_changed();
        }
    }

    pub fn set_ignore_settings_allowed(&self, package: &str, allowed: bool) {
        if allowed {
            self.ignore_settings_whitelist.insert(package.to_string());
        } else {
            self.ignore_settings_whitelist.remove(package);
        }
        for listener in self.listeners.snapshot() {
            listener.on_ignore_settings_whitelist_changed();
        }
    }

    pub fn set_coarse_accuracy_m(&self, accuracy_m: f64) {
        *self.coarse_accuracy_m.lock().unwrap() = accuracy_m;
    }
}

impl SettingsHelper for InMemorySettings {
    fn is_location_enabled(&self, user_id: UserId) -> bool {
        !self.location_disabled.contains(&user_id)
    }

    fn background_throttle_interval_ms(&self) -> u64 {
        self.background_throttle_interval_ms.load(Ordering::Relaxed)
    }

    fn is_package_blacklisted(&self, user_id: UserId, package: &str) -> bool {
        self.blacklist
            .get(&user_id)
            .map(|set| set.contains(package))
            .unwrap_or(false)
    }

    fn is_background_throttle_exempt(&self, package: &str) -> bool {
        self.throttle_whitelist.contains(package)
    }

    fn is_ignore_settings_allowed(&self, package: &str) -> bool {
        self.ignore_settings_whitelist.contains(package)
    }

    fn coarse_accuracy_m(&self) -> f64 {
        *self.coarse_accuracy_m.lock().unwrap()
    }

    fn add_listener(&self, listener: Arc<dyn SettingsListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    fn remove_listener(&self, id: ListenerId) {
        self.listeners.remove(id)
    }
}
