//! Outbound provider-changed broadcasts.

use crate::identity::UserId;
use std::sync::{Arc, Mutex};
use tracing::info;

/// Publishes provider enable-state transitions to the rest of the system.
/// Not invoked for the `fused` and `passive` providers.
pub trait ProviderChangeBroadcaster: Send + Sync {
    fn send_providers_changed(&self, user_id: UserId, provider: &str, enabled: bool);
}

/// Logs the transition and nothing else.
#[derive(Default)]
pub struct NoopBroadcaster;

impl ProviderChangeBroadcaster for NoopBroadcaster {
    fn send_providers_changed(&self, user_id: UserId, provider: &str, enabled: bool) {
        info!(user_id, provider, enabled, "providers changed");
    }
}

/// Records broadcasts for assertions.
#[derive(Default)]
pub struct RecordingBroadcaster {
    sent: Mutex<Vec<(UserId, String, bool)>>,
}

impl RecordingBroadcaster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<(UserId, String, bool)> {
        self.sent.lock().unwrap().clone()
    }
}

impl ProviderChangeBroadcaster for RecordingBroadcaster {
    fn send_providers_changed(&self, user_id: UserId, provider: &str, enabled: bool) {
        self.sent
            .lock()
            .unwrap()
            .push((user_id, provider.to_string(), enabled));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_captures_transitions() {
        let broadcaster = RecordingBroadcaster::new();
        broadcaster.send_providers_changed(0, "gps", false);
        broadcaster.send_providers_changed(0, "gps", true);
        assert_eq!(
            broadcaster.sent(),
            vec![(0, "gps".to_string(), false), (0, "gps".to_string(), true)]
        );
    }
}
