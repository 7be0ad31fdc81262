//! Provider adapters and the mock overlay.

use crate::identity::CallerIdentity;
use crate::location::Location;
use crate::request::ProviderRequest;
use std::sync::{Arc, Mutex};

pub const GPS_PROVIDER: &str = "gps";
pub const FUSED_PROVIDER: &str = "fused";
pub const PASSIVE_PROVIDER: &str = "passive";

/// Power class of the underlying hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PowerRequirement {
    #[default]
    Low,
    Medium,
    High,
}

/// Static properties of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProviderProperties {
    pub power_requirement: PowerRequirement,
}

/// Observable state of a provider adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderState {
    /// Whether the provider is currently allowed to produce locations.
    pub allowed: bool,
    /// Identity of the component backing the provider, if any.
    pub identity: Option<CallerIdentity>,
    pub properties: Option<ProviderProperties>,
}

impl ProviderState {
    /// The state of a manager with no provider attached.
    pub fn disallowed() -> Self {
        Self {
            allowed: false,
            identity: None,
            properties: None,
        }
    }
}

/// The underlying location driver.
///
/// `set_request` must be quick and non-blocking; it is invoked with the
/// multiplexer lock held. Fixes and state changes flow back through the
/// manager's `on_report_location` / `on_provider_state_changed` entry
/// points.
pub trait ProviderAdapter: Send + Sync {
    fn set_request(&self, request: &ProviderRequest);

    fn send_extra_command(&self, command: &str, args: &[String]);

    fn state(&self) -> ProviderState;
}

/// Hook for forwarding raw fixes to a passive provider manager.
pub trait PassiveRelay: Send + Sync {
    fn update_location(&self, location: &Location);
}

/// A scriptable provider: records the requests and commands it receives
/// and lets tests and the CLI flip its allowed state. Serves both as the
/// mock overlay target and as a stand-in real provider.
pub struct MockProvider {
    state: Mutex<ProviderState>,
    requests: Mutex<Vec<ProviderRequest>>,
    commands: Mutex<Vec<(String, Vec<String>)>>,
}

impl MockProvider {
    pub fn new(properties: ProviderProperties) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ProviderState {
                allowed: true,
                identity: None,
                properties: Some(properties),
            }),
            requests: Mutex::new(Vec::new()),
            commands: Mutex::new(Vec::new()),
        })
    }

    /// Flip the allowed state; returns whether it changed.
    pub fn set_allowed(&self, allowed: bool) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.allowed == allowed {
            false
        } else {
            state.allowed = allowed;
            true
        }
    }

    /// Every request pushed so far, oldest first.
    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn last_request(&self) -> Option<ProviderRequest> {
        self.requests.lock().unwrap().last().cloned()
    }

    pub fn commands(&self) -> Vec<(String, Vec<String>)> {
        self.commands.lock().unwrap().clone()
    }
}

impl ProviderAdapter for MockProvider {
    fn set_request(&self, request: &ProviderRequest) {
        self.requests.lock().unwrap().push(request.clone());
    }

    fn send_extra_command(&self, command: &str, args: &[String]) {
        self.commands
            .lock()
            .unwrap()
            .push((command.to_string(), args.to_vec()));
    }

    fn state(&self) -> ProviderState {
        self.state.lock().unwrap().clone()
    }
}

/// Routes between the real provider and a mock overlay. While a mock is
/// set it receives all requests and supplies all state; removing it
/// restores the real provider and replays the current request.
pub(crate) struct MockableProvider {
    real: Option<Arc<dyn ProviderAdapter>>,
    mock: Option<Arc<MockProvider>>,
    current_request: ProviderRequest,
}

impl MockableProvider {
    pub fn new() -> Self {
        Self {
            real: None,
            mock: None,
            current_request: ProviderRequest::disabled(),
        }
    }

    fn adapter(&self) -> Option<Arc<dyn ProviderAdapter>> {
        match &self.mock {
            Some(mock) => Some(Arc::clone(mock) as Arc<dyn ProviderAdapter>),
            None => self.real.clone(),
        }
    }

    pub fn is_mock(&self) -> bool {
        self.mock.is_some()
    }

    pub fn mock(&self) -> Option<&Arc<MockProvider>> {
        self.mock.as_ref()
    }

    pub fn state(&self) -> ProviderState {
        self.adapter()
            .map(|a| a.state())
            .unwrap_or_else(ProviderState::disallowed)
    }

    pub fn current_request(&self) -> &ProviderRequest {
        &self.current_request
    }

    pub fn set_request(&mut self, request: ProviderRequest) {
        self.current_request = request;
        if let Some(adapter) = self.adapter() {
            adapter.set_request(&self.current_request);
        }
    }

    pub fn send_extra_command(&self, command: &str, args: &[String]) {
        if let Some(adapter) = self.adapter() {
            adapter.send_extra_command(command, args);
        }
    }

    pub fn set_real(&mut self, real: Option<Arc<dyn ProviderAdapter>>) {
        self.real = real;
        if self.mock.is_none() {
            if let Some(adapter) = self.adapter() {
                adapter.set_request(&self.current_request);
            }
        }
    }

    /// Install or remove the mock overlay, replaying the current request to
    /// whichever adapter becomes active.
    pub fn set_mock(&mut self, mock: Option<Arc<MockProvider>>) {
        self.mock = mock;
        if let Some(adapter) = self.adapter() {
            adapter.set_request(&self.current_request);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Quality, WorkSource};

    fn request(interval_ms: u64) -> ProviderRequest {
        ProviderRequest {
            interval_ms,
            quality: Quality::Balanced,
            low_power: false,
            location_settings_ignored: false,
            work_source: WorkSource::single(1000, "a"),
        }
    }

    #[test]
    fn test_no_adapter_means_disallowed() {
        let provider = MockableProvider::new();
        assert!(!provider.state().allowed);
        assert!(!provider.is_mock());
    }

    #[test]
    fn test_requests_route_to_real_provider() {
        let mut provider = MockableProvider::new();
        let real = MockProvider::new(ProviderProperties::default());
        provider.set_real(Some(real.clone()));

        provider.set_request(request(1_000));
        assert_eq!(real.last_request().unwrap().interval_ms, 1_000);
    }

    #[test]
    fn test_mock_overlay_intercepts_requests() {
        let mut provider = MockableProvider::new();
        let real = MockProvider::new(ProviderProperties::default());
        provider.set_real(Some(real.clone()));
        provider.set_request(request(1_000));

        let mock = MockProvider::new(ProviderProperties::default());
        provider.set_mock(Some(mock.clone()));
        assert!(provider.is_mock());
        // the active request is replayed onto the mock
        assert_eq!(mock.last_request().unwrap().interval_ms, 1_000);

        provider.set_request(request(2_000));
        assert_eq!(mock.last_request().unwrap().interval_ms, 2_000);
        assert_eq!(real.last_request().unwrap().interval_ms, 1_000);
    }

    #[test]
    fn test_removing_mock_replays_request_to_real() {
        let mut provider = MockableProvider::new();
        let real = MockProvider::new(ProviderProperties::default());
        provider.set_real(Some(real.clone()));

        let mock = MockProvider::new(ProviderProperties::default());
        provider.set_mock(Some(mock));
        provider.set_request(request(5_000));

        provider.set_mock(None);
        assert!(!provider.is_mock());
        assert_eq!(real.last_request().unwrap().interval_ms, 5_000);
    }

    #[test]
    fn test_set_allowed_reports_change() {
        let mock = MockProvider::new(ProviderProperties::default());
        assert!(mock.state().allowed);
        assert!(mock.set_allowed(false));
        assert!(!mock.set_allowed(false));
        assert!(!mock.state().allowed);
    }

    #[test]
    fn test_extra_commands_are_recorded() {
        let mut provider = MockableProvider::new();
        let real = MockProvider::new(ProviderProperties::default());
        provider.set_real(Some(real.clone()));

        provider.send_extra_command("delete_aiding_data", &[]);
        assert_eq!(real.commands().len(), 1);
    }
}
