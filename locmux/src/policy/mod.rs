//! External policy surfaces consumed by the multiplexer.
//!
//! Each submodule defines the trait the manager programs against plus an
//! in-memory implementation suitable for embedding, simulation, and tests.
//! The in-memory implementations are the authoritative policy state for a
//! standalone deployment; a host system can supply its own implementations
//! instead.

pub mod appops;
pub mod attribution;
pub mod broadcast;
pub mod foreground;
pub mod permissions;
pub mod powersave;
pub mod registry;
pub mod screen;
pub mod settings;
pub mod users;

pub use appops::{AppOpsHelper, PermissiveAppOps, RecordingAppOps};
pub use attribution::{AttributionEvent, AttributionHelper, NoopAttribution, RecordingAttribution};
pub use broadcast::{NoopBroadcaster, ProviderChangeBroadcaster, RecordingBroadcaster};
pub use foreground::{AppForegroundHelper, ForegroundListener, InMemoryForeground};
pub use permissions::{
    InMemoryPermissions, PermissionLevel, PermissionsHelper, PermissionsListener,
};
pub use powersave::{InMemoryPowerSave, PowerSaveMode, PowerSaveModeHelper, PowerSaveModeListener};
pub use registry::{ProviderRegistry, StaticProviderRegistry};
pub use screen::{InMemoryScreen, ScreenInteractiveHelper, ScreenListener};
pub use settings::{InMemorySettings, SettingsHelper, SettingsListener};
pub use users::{InMemoryUsers, UserChange, UserInfoHelper, UserListener};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Handle for removing a previously added listener.
pub type ListenerId = u64;

/// Shared add/remove/notify plumbing for listener registries.
pub(crate) struct Listeners<T: ?Sized> {
    entries: Mutex<Vec<(ListenerId, Arc<T>)>>,
    next_id: AtomicU64,
}

impl<T: ?Sized> Default for Listeners<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<T: ?Sized> Listeners<T> {
    pub fn add(&self, listener: Arc<T>) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().unwrap().push((id, listener));
        id
    }

    pub fn remove(&self, id: ListenerId) {
        self.entries.lock().unwrap().retain(|(i, _)| *i != id);
    }

    /// Copy of the current listeners; notification happens outside any
    /// internal lock.
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect()
    }
}
