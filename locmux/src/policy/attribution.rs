//! Power and usage attribution reporting.

use crate::identity::{CallerIdentity, ClientKey};
use std::sync::{Arc, Mutex};

/// Sink for attribution transitions: which client is actively receiving
/// locations from which provider, and whether that use is high power.
pub trait AttributionHelper: Send + Sync {
    fn report_location_start(&self, identity: &CallerIdentity, provider: &str, key: ClientKey);
    fn report_location_stop(&self, identity: &CallerIdentity, provider: &str, key: ClientKey);
    fn report_high_power_start(&self, identity: &CallerIdentity, provider: &str, key: ClientKey);
    fn report_high_power_stop(&self, identity: &CallerIdentity, provider: &str, key: ClientKey);
}

#[derive(Default)]
pub struct NoopAttribution;

impl AttributionHelper for NoopAttribution {
    fn report_location_start(&self, _: &CallerIdentity, _: &str, _: ClientKey) {}
    fn report_location_stop(&self, _: &CallerIdentity, _: &str, _: ClientKey) {}
    fn report_high_power_start(&self, _: &CallerIdentity, _: &str, _: ClientKey) {}
    fn report_high_power_stop(&self, _: &CallerIdentity, _: &str, _: ClientKey) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributionEvent {
    LocationStart(ClientKey),
    LocationStop(ClientKey),
    HighPowerStart(ClientKey),
    HighPowerStop(ClientKey),
}

/// Records every report, for assertions.
#[derive(Default)]
pub struct RecordingAttribution {
    events: Mutex<Vec<AttributionEvent>>,
}

impl RecordingAttribution {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<AttributionEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl AttributionHelper for RecordingAttribution {
    fn report_location_start(&self, _: &CallerIdentity, _: &str, key: ClientKey) {
        self.events
            .lock()
            .unwrap()
            .push(AttributionEvent::LocationStart(key));
    }

    fn report_location_stop(&self, _: &CallerIdentity, _: &str, key: ClientKey) {
        self.events
            .lock()
            .unwrap()
            .push(AttributionEvent::LocationStop(key));
    }

    fn report_high_power_start(&self, _: &CallerIdentity, _: &str, key: ClientKey) {
        self.events
            .lock()
            .unwrap()
            .push(AttributionEvent::HighPowerStart(key));
    }

    fn report_high_power_stop(&self, _: &CallerIdentity, _: &str, key: ClientKey) {
        self.events
            .lock()
            .unwrap()
            .push(AttributionEvent::HighPowerStop(key));
    }
}
