//! Delivery worker.
//!
//! Transport deliveries are never performed under the multiplexer lock.
//! Operations are built while the lock is held, then handed to this worker
//! thread, which runs them in submission order. Per-registration delivery
//! order follows from the single queue.

use std::sync::mpsc::{self, Sender};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use tracing::warn;

type Operation = Box<dyn FnOnce() + Send>;

/// Single-threaded operation queue for transport deliveries and internal
/// listener notifications.
pub struct DeliveryExecutor {
    sender: Mutex<Option<Sender<Operation>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DeliveryExecutor {
    pub fn new(name: impl Into<String>) -> Self {
        let (sender, receiver) = mpsc::channel::<Operation>();

        let handle = thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                while let Ok(operation) = receiver.recv() {
                    operation();
                }
            })
            .expect("failed to spawn delivery thread");

        Self {
            sender: Mutex::new(Some(sender)),
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Enqueue an operation. Operations submitted after shutdown are
    /// silently dropped.
    pub fn execute(&self, operation: impl FnOnce() + Send + 'static) {
        let sender = self.sender.lock().unwrap();
        if let Some(sender) = sender.as_ref() {
            // the worker only exits once every sender is gone
            let _ = sender.send(Box::new(operation));
        }
    }

    /// Stop accepting work and wait for queued operations to finish.
    pub fn shutdown(&self) {
        drop(self.sender.lock().unwrap().take());
        if let Some(handle) = self.handle.lock().unwrap().take() {
            // an operation may drop the owner of this executor, in which
            // case the worker is shutting itself down and must not join
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!("delivery thread panicked");
            }
        }
    }
}

impl Drop for DeliveryExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
