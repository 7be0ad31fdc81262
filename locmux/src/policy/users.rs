//! Device user lifecycle.

use super::{ListenerId, Listeners};
use crate::identity::UserId;
use std::sync::{Arc, Mutex};

/// What happened to a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserChange {
    Started,
    Stopped,
    CurrentChanged,
}

pub trait UserListener: Send + Sync {
    fn on_user_changed(&self, user_id: UserId, change: UserChange);
}

/// Read access to the running-user set plus change subscription.
pub trait UserInfoHelper: Send + Sync {
    fn running_user_ids(&self) -> Vec<UserId>;

    fn is_current_user(&self, user_id: UserId) -> bool;

    fn add_listener(&self, listener: Arc<dyn UserListener>) -> ListenerId;

    fn remove_listener(&self, id: ListenerId);
}

struct UserState {
    running: Vec<UserId>,
    current: UserId,
}

/// In-memory user table. Starts with one running user that is current.
pub struct InMemoryUsers {
    state: Mutex<UserState>,
    listeners: Listeners<dyn UserListener>,
}

impl InMemoryUsers {
    pub fn new(current: UserId) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(UserState {
                running: vec![current],
                current,
            }),
            listeners: Listeners::default(),
        })
    }

    pub fn start_user(&self, user_id: UserId) {
        {
            let mut state = self.state.lock().unwrap();
            if state.running.contains(&user_id) {
                return;
            }
            state.running.push(user_id);
        }
        for listener in self.listeners.snapshot() {
            listener.on_user_changed(user_id, UserChange::Started);
        }
    }

    pub fn stop_user(&self, user_id: UserId) {
        {
            let mut state = self.state.lock().unwrap();
            let before = state.running.len();
            state.running.retain(|u| *u != user_id);
            if state.running.len() == before {
                return;
            }
        }
        for listener in self.listeners.snapshot() {
            listener.on_user_changed(user_id, UserChange::Stopped);
        }
    }

    /// Switch the current user, starting it if needed.
    pub fn switch_user(&self, user_id: UserId) {
        let previous;
        {
            let mut state = self.state.lock().unwrap();
            if state.current == user_id {
                return;
            }
            previous = state.current;
            state.current = user_id;
            if !state.running.contains(&user_id) {
                state.running.push(user_id);
            }
        }
        // both the old and the new current user change eligibility
        for listener in self.listeners.snapshot() {
            listener.on_user_changed(previous, UserChange::CurrentChanged);
            listener.on_user_changed(user_id, UserChange::CurrentChanged);
        }
    }
}

impl UserInfoHelper for InMemoryUsers {
    fn running_user_ids(&self) -> Vec<UserId> {
        self.state.lock().unwrap().running.clone()
    }

    fn is_current_user(&self, user_id: UserId) -> bool {
        self.state.lock().unwrap().current == user_id
    }

    fn add_listener(&self, listener: Arc<dyn UserListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    fn remove_listener(&self, id: ListenerId) {
        self.listeners.remove(id)
    }
}
