//! Location power save mode.

use super::{ListenerId, Listeners};
use std::sync::{Arc, Mutex};

/// System-wide battery saver constraint on location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PowerSaveMode {
    #[default]
    NoChange,
    ForegroundOnly,
    GpsDisabledWhenScreenOff,
    ThrottleRequestsWhenScreenOff,
    AllDisabledWhenScreenOff,
}

pub trait PowerSaveModeListener: Send + Sync {
    fn on_power_save_mode_changed(&self, mode: PowerSaveMode);
}

pub trait PowerSaveModeHelper: Send + Sync {
    fn mode(&self) -> PowerSaveMode;

    fn add_listener(&self, listener: Arc<dyn PowerSaveModeListener>) -> ListenerId;

    fn remove_listener(&self, id: ListenerId);
}

#[derive(Default)]
pub struct InMemoryPowerSave {
    mode: Mutex<PowerSaveMode>,
    listeners: Listeners<dyn PowerSaveModeListener>,
}

impl InMemoryPowerSave {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_mode(&self, mode: PowerSaveMode) {
        {
            let mut current = self.mode.lock().unwrap();
            if *current == mode {
                return;
            }
            *current = mode;
        }
        for listener in self.listeners.snapshot() {
            listener.on_power_save_mode_changed(mode);
        }
    }
}

impl PowerSaveModeHelper for InMemoryPowerSave {
    fn mode(&self) -> PowerSaveMode {
        *self.mode.lock().unwrap()
    }

    fn add_listener(&self, listener: Arc<dyn PowerSaveModeListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    fn remove_listener(&self, id: ListenerId) {
        self.listeners.remove(id)
    }
}
