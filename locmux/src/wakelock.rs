//! Delivery wakelocks and single-use completion callbacks.

use crate::alarm::{AlarmHelper, AlarmToken};
use crate::request::WorkSource;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use tracing::warn;

/// A callback that runs at most once, no matter how many times or from
/// which threads it is invoked.
///
/// Handed to transports as the delivery-completion token; a client cannot
/// break wakelock accounting by invoking it repeatedly.
pub struct SingleUseCallback {
    callback: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl SingleUseCallback {
    pub fn new(callback: impl FnOnce() + Send + 'static) -> Arc<Self> {
        Arc::new(Self {
            callback: Mutex::new(Some(Box::new(callback))),
        })
    }

    /// Run the wrapped callback if it has not run yet.
    pub fn invoke(&self) {
        let callback = self.callback.lock().unwrap().take();
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Whether the callback has already been consumed.
    pub fn is_spent(&self) -> bool {
        self.callback.lock().unwrap().is_none()
    }
}

impl std::fmt::Debug for SingleUseCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleUseCallback")
            .field("spent", &self.is_spent())
            .finish()
    }
}

struct Acquisition {
    id: u64,
    timeout_alarm: AlarmToken,
}

#[derive(Default)]
struct WakeLockState {
    held: VecDeque<Acquisition>,
    next_id: u64,
    acquired_total: u64,
    released_total: u64,
}

struct WakeLockInner {
    tag: String,
    work_source: WorkSource,
    alarms: Arc<dyn AlarmHelper>,
    state: Mutex<WakeLockState>,
}

/// Reference-counted wakelock with a per-acquisition timeout.
///
/// Each acquisition is released either explicitly (normally through a
/// [`SingleUseCallback`]) or by its timeout alarm. The work source is the
/// originating request's, so power lands on the client even though
/// deliveries run on our threads.
#[derive(Clone)]
pub struct WakeLock {
    inner: Arc<WakeLockInner>,
}

impl WakeLock {
    pub fn new(tag: impl Into<String>, work_source: WorkSource, alarms: Arc<dyn AlarmHelper>) -> Self {
        Self {
            inner: Arc::new(WakeLockInner {
                tag: tag.into(),
                work_source,
                alarms,
                state: Mutex::new(WakeLockState::default()),
            }),
        }
    }

    /// Acquire one reference, auto-released after `timeout_ms`.
    pub fn acquire(&self, timeout_ms: u64) {
        let weak = Arc::downgrade(&self.inner);
        let mut state = self.inner.state.lock().unwrap();
        state.next_id += 1;
        let id = state.next_id;

        let timeout_alarm = self.inner.alarms.set_delayed_alarm(
            timeout_ms,
            &self.inner.work_source,
            Box::new(move || WakeLock::timed_release(&weak, id)),
        );

        state.held.push_back(Acquisition { id, timeout_alarm });
        state.acquired_total += 1;
    }

    /// Release the oldest outstanding acquisition. A no-op when nothing is
    /// held (the timeout may already have fired).
    pub fn release(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if let Some(acquisition) = state.held.pop_front() {
            state.released_total += 1;
            drop(state);
            self.inner.alarms.cancel(acquisition.timeout_alarm);
        }
    }

    fn timed_release(inner: &Weak<WakeLockInner>, id: u64) {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let mut state = inner.state.lock().unwrap();
        let before = state.held.len();
        state.held.retain(|a| a.id != id);
        if state.held.len() != before {
            state.released_total += 1;
            warn!(tag = %inner.tag, "wakelock timed out");
        }
    }

    pub fn is_held(&self) -> bool {
        !self.inner.state.lock().unwrap().held.is_empty()
    }

    /// Total acquisitions over the lifetime of the lock.
    pub fn acquired_total(&self) -> u64 {
        self.inner.state.lock().unwrap().acquired_total
    }

    /// Total releases (explicit or timed out) over the lifetime of the lock.
    pub fn released_total(&self) -> u64 {
        self.inner.state.lock().unwrap().released_total
    }
}

impl std::fmt::Debug for WakeLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WakeLock")
            .field("tag", &self.inner.tag)
            .field("held", &self.is_held())
            .finish()
    }
}
