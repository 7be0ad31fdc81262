//! Screen interactivity.

use super::{ListenerId, Listeners};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub trait ScreenListener: Send + Sync {
    fn on_screen_interactive_changed(&self, interactive: bool);
}

pub trait ScreenInteractiveHelper: Send + Sync {
    fn is_interactive(&self) -> bool;

    fn add_listener(&self, listener: Arc<dyn ScreenListener>) -> ListenerId;

    fn remove_listener(&self, id: ListenerId);
}

/// In-memory screen state, interactive by default.
pub struct InMemoryScreen {
    interactive: AtomicBool,
    listeners: Listeners<dyn ScreenListener>,
}

impl Default for InMemoryScreen {
    fn default() -> Self {
        Self {
            interactive: AtomicBool::new(true),
            listeners: Listeners::default(),
        }
    }
}

impl InMemoryScreen {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_interactive(&self, interactive: bool) {
        if self.interactive.swap(interactive, Ordering::SeqCst) != interactive {
            for listener in self.listeners.snapshot() {
                listener.on_screen_interactive_changed(interactive);
            }
        }
    }
}

impl ScreenInteractiveHelper for InMemoryScreen {
    fn is_interactive(&self) -> bool {
        self.interactive.load(Ordering::SeqCst)
    }

    fn add_listener(&self, listener: Arc<dyn ScreenListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    fn remove_listener(&self, id: ListenerId) {
        self.listeners.remove(id)
    }
}
