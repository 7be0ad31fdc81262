//! One-shot alarm scheduling.
//!
//! The multiplexer needs cancellable one-shot timers for registration
//! expiration, delayed provider re-registration, and wakelock timeouts.
//! [`AlarmHelper`] is the seam; [`TimerAlarms`] is the in-process
//! implementation backed by a dedicated timer thread.

use crate::request::WorkSource;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Handle identifying a scheduled alarm, for cancellation.
pub type AlarmToken = u64;

/// One-shot alarm scheduling with cancellation.
///
/// Listeners run on an arbitrary thread and may take locks; implementations
/// must not invoke them while holding internal state locks.
pub trait AlarmHelper: Send + Sync {
    /// Schedule `listener` to run once after `delay_ms`. The work source
    /// attributes the wakeup for power accounting.
    fn set_delayed_alarm(
        &self,
        delay_ms: u64,
        work_source: &WorkSource,
        listener: Box<dyn FnOnce() + Send>,
    ) -> AlarmToken;

    /// Cancel a pending alarm. A no-op for unknown or already-fired tokens.
    fn cancel(&self, token: AlarmToken);
}

struct AlarmEntry {
    token: AlarmToken,
    deadline_ms: u64,
    listener: Box<dyn FnOnce() + Send>,
}

#[derive(Default)]
struct TimerState {
    pending: Vec<AlarmEntry>,
    next_token: AlarmToken,
    shutdown: bool,
}

/// Timer-thread implementation of [`AlarmHelper`].
pub struct TimerAlarms {
    state: Arc<(Mutex<TimerState>, Condvar)>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TimerAlarms {
    pub fn new() -> Arc<Self> {
        let state: Arc<(Mutex<TimerState>, Condvar)> = Arc::default();
        let worker_state = Arc::clone(&state);

        let handle = thread::Builder::new()
            .name("locmux-alarm".to_string())
            .spawn(move || Self::run_loop(worker_state))
            .expect("failed to spawn alarm thread");

        Arc::new(Self {
            state,
            handle: Mutex::new(Some(handle)),
        })
    }

    fn run_loop(state: Arc<(Mutex<TimerState>, Condvar)>) {
        let (lock, condvar) = &*state;
        let mut guard = lock.lock().unwrap();

        loop {
            if guard.shutdown {
                break;
            }

            let now = crate::time::elapsed_realtime_millis();
            let due_index = guard
                .pending
                .iter()
                .enumerate()
                .filter(|(_, e)| e.deadline_ms <= now)
                .min_by_key(|(_, e)| e.deadline_ms)
                .map(|(i, _)| i);

            if let Some(index) = due_index {
                let entry = guard.pending.swap_remove(index);
                // run the listener without holding the state lock, it may
                // re-enter to schedule or cancel
                drop(guard);
                debug!(token = entry.token, "alarm fired");
                (entry.listener)();
                guard = lock.lock().unwrap();
                continue;
            }

            let next_deadline = guard.pending.iter().map(|e| e.deadline_ms).min();
            guard = match next_deadline {
                Some(deadline) => {
                    let wait = deadline.saturating_sub(now);
                    condvar
                        .wait_timeout(guard, Duration::from_millis(wait.max(1)))
                        .unwrap()
                        .0
                }
                None => condvar.wait(guard).unwrap(),
            };
        }
    }

    /// Number of alarms currently pending.
    pub fn pending_count(&self) -> usize {
        self.state.0.lock().unwrap().pending.len()
    }

    fn shutdown(&self) {
        {
            let mut guard = self.state.0.lock().unwrap();
            guard.shutdown = true;
            guard.pending.clear();
        }
        self.state.1.notify_all();
        if let Some(handle) = self.handle.lock().unwrap().take() {
            // a listener may drop the last reference to this helper, in
            // which case the timer thread is tearing itself down
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!("alarm thread panicked");
            }
        }
    }
}

impl AlarmHelper for TimerAlarms {
    fn set_delayed_alarm(
        &self,
        delay_ms: u64,
        _work_source: &WorkSource,
        listener: Box<dyn FnOnce() + Send>,
    ) -> AlarmToken {
        let token;
        {
            let mut guard = self.state.0.lock().unwrap();
            guard.next_token += 1;
            token = guard.next_token;
            guard.pending.push(AlarmEntry {
                token,
                deadline_ms: crate::time::elapsed_realtime_millis().saturating_add(delay_ms),
                listener,
            });
        }
        self.state.1.notify_all();
        token
    }

    fn cancel(&self, token: AlarmToken) {
        let mut guard = self.state.0.lock().unwrap();
        guard.pending.retain(|e| e.token != token);
    }
}

impl Drop for TimerAlarms {
    fn drop(&mut self) {
        self.shutdown();
    }
}
