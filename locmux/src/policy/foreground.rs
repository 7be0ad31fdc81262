//! App foreground state.

use super::{ListenerId, Listeners};
use dashmap::DashMap;
use std::sync::Arc;

pub trait ForegroundListener: Send + Sync {
    fn on_foreground_changed(&self, uid: u32, foreground: bool);
}

pub trait AppForegroundHelper: Send + Sync {
    fn is_app_foreground(&self, uid: u32) -> bool;

    fn add_listener(&self, listener: Arc<dyn ForegroundListener>) -> ListenerId;

    fn remove_listener(&self, id: ListenerId);
}

/// In-memory foreground tracker. Unknown uids count as foreground until
/// told otherwise.
#[derive(Default)]
pub struct InMemoryForeground {
    background: DashMap<u32, ()>,
    listeners: Listeners<dyn ForegroundListener>,
}

impl InMemoryForeground {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_foreground(&self, uid: u32, foreground: bool) {
        let changed = if foreground {
            self.background.remove(&uid).is_some()
        } else {
            self.background.insert(uid, ()).is_none()
        };
        if changed {
            for listener in self.listeners.snapshot() {
                listener.on_foreground_changed(uid, foreground);
            }
        }
    }
}

impl AppForegroundHelper for InMemoryForeground {
    fn is_app_foreground(&self, uid: u32) -> bool {
        !self.background.contains_key(&uid)
    }

    fn add_listener(&self, listener: Arc<dyn ForegroundListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    fn remove_listener(&self, id: ListenerId) {
        self.listeners.remove(id)
    }
}
