//! The per-provider location request multiplexer.
//!
//! [`LocationProviderManager`] fronts one named provider: it accepts many
//! concurrent client subscriptions, merges them into a single provider
//! request, fans incoming fixes back out to the eligible subset of clients,
//! and reacts to every policy surface that can change eligibility (users,
//! settings, permissions, foreground, power save, screen, blacklists).
//!
//! Concurrency model: one coarse lock guards all mutable state. Public entry
//! points, alarm callbacks, and policy callbacks all take it. Transport
//! deliveries are built under the lock as [`DeliveryTask`]s and executed on
//! the delivery worker outside it; completion re-enters the lock for
//! max-updates accounting and failure removal.

use crate::alarm::{AlarmHelper, AlarmToken};
use crate::events::{Event, EventLog, Record};
use crate::executor::DeliveryExecutor;
use crate::fudger::LocationFudger;
use crate::identity::{CallerIdentity, ClientKey, UserId, UserScope};
use crate::last_location::LastLocation;
use crate::location::Location;
use crate::policy::{
    AppForegroundHelper, AppOpsHelper, AttributionHelper, ForegroundListener, InMemoryForeground,
    InMemoryPermissions, InMemoryPowerSave, InMemoryScreen, InMemorySettings, InMemoryUsers,
    ListenerId, NoopAttribution, NoopBroadcaster, PermissionLevel, PermissionsHelper,
    PermissionsListener, PermissiveAppOps, PowerSaveMode, PowerSaveModeHelper,
    PowerSaveModeListener, ProviderChangeBroadcaster, ProviderRegistry, ScreenInteractiveHelper,
    ScreenListener, SettingsHelper, SettingsListener, StaticProviderRegistry, UserChange,
    UserInfoHelper, UserListener,
};
use crate::provider::{
    MockProvider, MockableProvider, PassiveRelay, ProviderAdapter, ProviderProperties,
    ProviderState, PowerRequirement, FUSED_PROVIDER, GPS_PROVIDER, PASSIVE_PROVIDER,
};
use crate::registration::{Registration, RegistrationKind};
use crate::request::{LocationRequest, ProviderRequest, Quality, WorkSource, INTERVAL_DISABLED, PASSIVE_INTERVAL};
use crate::time;
use crate::transport::{LocationTransport, ProviderTransport};
use crate::wakelock::{SingleUseCallback, WakeLock};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, Weak};
use thiserror::Error;
use tracing::{debug, warn};

const WAKELOCK_TAG: &str = "*location*";
const WAKELOCK_TIMEOUT_MS: u64 = 30 * 1000;

/// Effective intervals under this make an active registration "high power"
/// when the provider hardware is power-hungry.
const MAX_HIGH_POWER_INTERVAL_MS: u64 = 5 * 60 * 1000;

/// Max age of a cached location that can satisfy a current-location request.
const MAX_CURRENT_LOCATION_AGE_MS: u64 = 10 * 1000;

/// Cap on the duration of a current-location request.
const GET_CURRENT_LOCATION_MAX_TIMEOUT_MS: u64 = 30 * 1000;

/// Jitter tolerance for min-update-interval checks, as a share of the
/// interval and as an absolute cap.
const FASTEST_INTERVAL_JITTER_PERCENTAGE: f64 = 0.10;
const MAX_FASTEST_INTERVAL_JITTER_MS: u64 = 5 * 1000;

/// Provider request delays below this are applied immediately.
pub(crate) const MIN_REQUEST_DELAY_MS: u64 = 30 * 1000;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("manager is not started")]
    NotStarted,

    #[error("request work source must not be empty")]
    EmptyWorkSource,

    #[error("max updates must be at least 1")]
    InvalidMaxUpdates,

    #[error("{0} provider is not a test provider")]
    NotMockProvider(String),
}

/// Internal consumer of provider enable-state transitions. Notified on the
/// delivery worker, never under the lock.
pub trait ProviderEnabledListener: Send + Sync {
    fn on_provider_enabled_changed(&self, provider: &str, user_id: UserId, enabled: bool);
}

/// Handle returned from [`LocationProviderManager::get_current_location`].
/// Cancelling is idempotent.
pub struct CancellationHandle {
    manager: Weak<LocationProviderManager>,
    key: ClientKey,
}

impl CancellationHandle {
    pub fn cancel(&self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.unregister_location_request(self.key);
        }
    }

    pub fn key(&self) -> ClientKey {
        self.key
    }
}

/// A delivery built under the lock, executed on the worker.
enum DeliveryTask {
    Location {
        key: ClientKey,
        identity: CallerIdentity,
        transport: Arc<dyn LocationTransport>,
        location: Location,
        completion: Option<Arc<SingleUseCallback>>,
    },
    OneShot {
        key: ClientKey,
        identity: CallerIdentity,
        transport: Arc<dyn LocationTransport>,
        location: Option<Location>,
    },
    Enabled {
        key: ClientKey,
        transport: Arc<dyn ProviderTransport>,
        enabled: bool,
    },
    EnabledListeners {
        listeners: Vec<Arc<dyn ProviderEnabledListener>>,
        user_id: UserId,
        enabled: bool,
    },
    Broadcast {
        user_id: UserId,
        enabled: bool,
    },
}

enum AcceptOutcome {
    Deliver { task: DeliveryTask, remove: bool },
    Expired,
    Rejected,
}

struct Subscriptions {
    settings: ListenerId,
    users: ListenerId,
    permissions: ListenerId,
    foreground: ListenerId,
    power_save: ListenerId,
    screen: ListenerId,
}

struct Inner {
    started: bool,
    provider: MockableProvider,
    /// Last merged request computed, which may not yet be applied while a
    /// delayed re-registration is pending.
    merged: ProviderRequest,
    enabled: HashMap<UserId, bool>,
    last_locations: HashMap<UserId, LastLocation>,
    registrations: Vec<Registration>,
    delayed_register: Option<(u64, AlarmToken)>,
    delayed_generation: u64,
    enabled_listeners: Vec<(ListenerId, Arc<dyn ProviderEnabledListener>)>,
    next_enabled_listener_id: ListenerId,
    subscriptions: Option<Subscriptions>,
}

/// Builder wiring a manager to its collaborators. Every collaborator has an
/// in-memory default, so `LocationProviderManager::builder("gps").build()`
/// yields a fully self-contained manager.
pub struct ManagerBuilder {
    name: String,
    settings: Arc<dyn SettingsHelper>,
    users: Arc<dyn UserInfoHelper>,
    alarms: Arc<dyn AlarmHelper>,
    app_ops: Arc<dyn AppOpsHelper>,
    permissions: Arc<dyn PermissionsHelper>,
    foreground: Arc<dyn AppForegroundHelper>,
    power_save: Arc<dyn PowerSaveModeHelper>,
    screen: Arc<dyn ScreenInteractiveHelper>,
    attribution: Arc<dyn AttributionHelper>,
    providers: Arc<dyn ProviderRegistry>,
    broadcaster: Arc<dyn ProviderChangeBroadcaster>,
    passive: Option<Arc<dyn PassiveRelay>>,
    fudger_seed: Option<u64>,
    event_log_capacity: usize,
}

impl ManagerBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            settings: InMemorySettings::new(),
            users: InMemoryUsers::new(0),
            alarms: crate::alarm::TimerAlarms::new(),
            app_ops: Arc::new(PermissiveAppOps),
            permissions: InMemoryPermissions::new(),
            foreground: InMemoryForeground::new(),
            power_save: InMemoryPowerSave::new(),
            screen: InMemoryScreen::new(),
            attribution: Arc::new(NoopAttribution),
            providers: StaticProviderRegistry::new(),
            broadcaster: Arc::new(NoopBroadcaster),
            passive: None,
            fudger_seed: None,
            event_log_capacity: crate::events::DEFAULT_EVENT_LOG_CAPACITY,
        }
    }

    pub fn settings(mut self, settings: Arc<dyn SettingsHelper>) -> Self {
        self.settings = settings;
        self
    }

    pub fn users(mut self, users: Arc<dyn UserInfoHelper>) -> Self {
        self.users = users;
        self
    }

    pub fn alarms(mut self, alarms: Arc<dyn AlarmHelper>) -> Self {
        self.alarms = alarms;
        self
    }

    pub fn app_ops(mut self, app_ops: Arc<dyn AppOpsHelper>) -> Self {
        self.app_ops = app_ops;
        self
    }

    pub fn permissions(mut self, permissions: Arc<dyn PermissionsHelper>) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn foreground(mut self, foreground: Arc<dyn AppForegroundHelper>) -> Self {
        self.foreground = foreground;
        self
    }

    pub fn power_save(mut self, power_save: Arc<dyn PowerSaveModeHelper>) -> Self {
        self.power_save = power_save;
        self
    }

    pub fn screen(mut self, screen: Arc<dyn ScreenInteractiveHelper>) -> Self {
        self.screen = screen;
        self
    }

    pub fn attribution(mut self, attribution: Arc<dyn AttributionHelper>) -> Self {
        self.attribution = attribution;
        self
    }

    pub fn provider_registry(mut self, providers: Arc<dyn ProviderRegistry>) -> Self {
        self.providers = providers;
        self
    }

    pub fn broadcaster(mut self, broadcaster: Arc<dyn ProviderChangeBroadcaster>) -> Self {
        self.broadcaster = broadcaster;
        self
    }

    pub fn passive_relay(mut self, passive: Arc<dyn PassiveRelay>) -> Self {
        self.passive = Some(passive);
        self
    }

    pub fn fudger_seed(mut self, seed: u64) -> Self {
        self.fudger_seed = Some(seed);
        self
    }

    pub fn event_log_capacity(mut self, capacity: usize) -> Self {
        self.event_log_capacity = capacity;
        self
    }

    pub fn build(self) -> Arc<LocationProviderManager> {
        let fudger = LocationFudger::new(
            self.settings.coarse_accuracy_m(),
            self.fudger_seed.unwrap_or_else(time::wall_clock_millis),
        );
        let event_log = EventLog::new(self.name.clone(), self.event_log_capacity);
        let executor = DeliveryExecutor::new(format!("locmux-{}", self.name));

        Arc::new_cyclic(|weak| LocationProviderManager {
            name: self.name,
            settings: self.settings,
            users: self.users,
            alarms: self.alarms,
            app_ops: self.app_ops,
            permissions: self.permissions,
            foreground: self.foreground,
            power_save: self.power_save,
            screen: self.screen,
            attribution: self.attribution,
            providers: self.providers,
            broadcaster: self.broadcaster,
            passive: self.passive,
            fudger,
            event_log,
            executor,
            weak_self: weak.clone(),
            inner: Mutex::new(Inner {
                started: false,
                provider: MockableProvider::new(),
                merged: ProviderRequest::disabled(),
                enabled: HashMap::new(),
                last_locations: HashMap::new(),
                registrations: Vec::new(),
                delayed_register: None,
                delayed_generation: 0,
                enabled_listeners: Vec::new(),
                next_enabled_listener_id: 1,
                subscriptions: None,
            }),
        })
    }
}

pub struct LocationProviderManager {
    name: String,
    inner: Mutex<Inner>,
    settings: Arc<dyn SettingsHelper>,
    users: Arc<dyn UserInfoHelper>,
    alarms: Arc<dyn AlarmHelper>,
    app_ops: Arc<dyn AppOpsHelper>,
    permissions: Arc<dyn PermissionsHelper>,
    foreground: Arc<dyn AppForegroundHelper>,
    power_save: Arc<dyn PowerSaveModeHelper>,
    screen: Arc<dyn ScreenInteractiveHelper>,
    attribution: Arc<dyn AttributionHelper>,
    providers: Arc<dyn ProviderRegistry>,
    broadcaster: Arc<dyn ProviderChangeBroadcaster>,
    passive: Option<Arc<dyn PassiveRelay>>,
    fudger: LocationFudger,
    event_log: EventLog,
    executor: DeliveryExecutor,
    weak_self: Weak<LocationProviderManager>,
}

impl LocationProviderManager {
    pub fn builder(name: impl Into<String>) -> ManagerBuilder {
        ManagerBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_started(&self) -> bool {
        self.inner.lock().unwrap().started
    }

    /// Observable state of the underlying provider.
    pub fn state(&self) -> ProviderState {
        self.inner.lock().unwrap().provider.state()
    }

    pub fn properties(&self) -> Option<ProviderProperties> {
        self.state().properties
    }

    /// The request last applied to the provider.
    pub fn current_request(&self) -> ProviderRequest {
        self.inner.lock().unwrap().provider.current_request().clone()
    }

    pub fn is_mock(&self) -> bool {
        self.inner.lock().unwrap().provider.is_mock()
    }

    pub fn event_records(&self) -> Vec<Record> {
        self.event_log.snapshot()
    }

    // ------------------------------------------------------------------
    // lifecycle
    // ------------------------------------------------------------------

    pub fn start_manager(&self) {
        let mut tasks = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.started {
                return;
            }
            inner.started = true;

            let bridge = Arc::new(PolicyBridge {
                manager: self.weak_self.clone(),
            });
            inner.subscriptions = Some(Subscriptions {
                settings: self.settings.add_listener(bridge.clone()),
                users: self.users.add_listener(bridge.clone()),
                permissions: self.permissions.add_listener(bridge.clone()),
                foreground: self.foreground.add_listener(bridge.clone()),
                power_save: self.power_save.add_listener(bridge.clone()),
                screen: self.screen.add_listener(bridge),
            });

            // first observation of each running user is silent
            inner.enabled.clear();
            self.on_enabled_changed_locked(&mut inner, &mut tasks, UserScope::All);
        }
        self.dispatch(tasks);
    }

    pub fn stop_manager(&self) {
        let mut tasks = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            if !inner.started {
                return;
            }
            inner.started = false;

            self.on_enabled_changed_locked(&mut inner, &mut tasks, UserScope::All);

            let keys: Vec<ClientKey> = inner.registrations.iter().map(|r| r.key).collect();
            for key in keys {
                self.remove_registration_locked(&mut inner, &mut tasks, key);
            }

            if let Some((_, token)) = inner.delayed_register.take() {
                self.alarms.cancel(token);
            }

            if let Some(subscriptions) = inner.subscriptions.take() {
                self.settings.remove_listener(subscriptions.settings);
                self.users.remove_listener(subscriptions.users);
                self.permissions.remove_listener(subscriptions.permissions);
                self.foreground.remove_listener(subscriptions.foreground);
                self.power_save.remove_listener(subscriptions.power_save);
                self.screen.remove_listener(subscriptions.screen);
            }

            if !inner.enabled_listeners.is_empty() {
                warn!(
                    provider = %self.name,
                    "enabled listeners still registered at stop"
                );
                inner.enabled_listeners.clear();
            }
        }
        self.dispatch(tasks);
    }

    // ------------------------------------------------------------------
    // provider wiring
    // ------------------------------------------------------------------

    pub fn set_real_provider(&self, provider: Option<Arc<dyn ProviderAdapter>>) {
        let mut tasks = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            inner.provider.set_real(provider);
            self.on_enabled_changed_locked(&mut inner, &mut tasks, UserScope::All);
        }
        self.dispatch(tasks);
    }

    pub fn set_mock_provider(&self, mock: Option<Arc<MockProvider>>) {
        let mut tasks = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            self.event_log.log(Event::MockToggled {
                mocked: mock.is_some(),
            });
            let clearing = mock.is_none();
            inner.provider.set_mock(mock);

            if clearing {
                // mock sessions can leak the fudger's grid alignment, so both
                // the mock-sourced cache entries and the offsets go
                for cache in inner.last_locations.values_mut() {
                    cache.clear_mock();
                }
                self.fudger.reset_offsets();
            }

            self.on_enabled_changed_locked(&mut inner, &mut tasks, UserScope::All);
        }
        self.dispatch(tasks);
    }

    pub fn set_mock_provider_allowed(&self, allowed: bool) -> Result<(), ManagerError> {
        let mut tasks = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            let Some(mock) = inner.provider.mock().cloned() else {
                return Err(ManagerError::NotMockProvider(self.name.clone()));
            };
            if mock.set_allowed(allowed) {
                self.on_enabled_changed_locked(&mut inner, &mut tasks, UserScope::All);
            }
        }
        self.dispatch(tasks);
        Ok(())
    }

    pub fn set_mock_provider_location(&self, mut location: Location) -> Result<(), ManagerError> {
        let mut tasks = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            if !inner.provider.is_mock() {
                return Err(ManagerError::NotMockProvider(self.name.clone()));
            }
            if !location.provider.is_empty() && location.provider != self.name {
                // the caller may be trying to masquerade as another provider
                warn!(
                    provider = %self.name,
                    claimed = %location.provider,
                    "mock location carries a different provider name"
                );
            }
            location.provider = self.name.clone();
            location.from_mock = true;
            self.report_location_locked(&mut inner, &mut tasks, location);
        }
        self.dispatch(tasks);
        Ok(())
    }

    pub fn send_extra_command(&self, command: &str, args: &[String]) {
        self.inner
            .lock()
            .unwrap()
            .provider
            .send_extra_command(command, args);
    }

    /// Re-read provider state after an out-of-band change (a real provider
    /// flipping its allowed flag).
    pub fn on_provider_state_changed(&self) {
        let mut tasks = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            self.on_enabled_changed_locked(&mut inner, &mut tasks, UserScope::All);
        }
        self.dispatch(tasks);
    }

    /// Feed a fix from the provider into the multiplexer.
    pub fn on_report_location(&self, location: Location) {
        let mut tasks = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            if !inner.started {
                return;
            }
            self.report_location_locked(&mut inner, &mut tasks, location);
        }
        self.dispatch(tasks);
    }

    // ------------------------------------------------------------------
    // client API
    // ------------------------------------------------------------------

    /// Register (or replace) a continuous subscription under `key`.
    pub fn register_location_request<T>(
        &self,
        key: ClientKey,
        request: LocationRequest,
        identity: CallerIdentity,
        permission_level: PermissionLevel,
        transport: Arc<T>,
    ) -> Result<(), ManagerError>
    where
        T: LocationTransport + ProviderTransport + 'static,
    {
        validate_request(&request)?;

        let location_transport: Arc<dyn LocationTransport> = transport.clone();
        let provider_transport: Arc<dyn ProviderTransport> = transport;
        let wakelock = WakeLock::new(
            WAKELOCK_TAG,
            request.work_source.clone(),
            Arc::clone(&self.alarms),
        );
        let registration = Registration::new_continuous(
            key,
            request,
            identity,
            permission_level,
            location_transport,
            provider_transport,
            wakelock,
        );

        let mut tasks = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            if !inner.started {
                return Err(ManagerError::NotStarted);
            }
            self.put_registration_locked(&mut inner, &mut tasks, registration);
        }
        self.dispatch(tasks);
        Ok(())
    }

    /// Remove a subscription. Idempotent.
    pub fn unregister_location_request(&self, key: ClientKey) {
        let mut tasks = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            self.remove_registration_locked(&mut inner, &mut tasks, key);
        }
        self.dispatch(tasks);
    }

    /// One-shot current-location request. The single delivery is either a
    /// location or, when the request cannot be satisfied, nothing
    /// (`None`).
    pub fn get_current_location<T>(
        &self,
        mut request: LocationRequest,
        identity: CallerIdentity,
        permission_level: PermissionLevel,
        transport: Arc<T>,
    ) -> Result<CancellationHandle, ManagerError>
    where
        T: LocationTransport + 'static,
    {
        validate_request(&request)?;
        if request.duration_ms > GET_CURRENT_LOCATION_MAX_TIMEOUT_MS {
            request.duration_ms = GET_CURRENT_LOCATION_MAX_TIMEOUT_MS;
        }

        let key = ClientKey::next();
        let location_transport: Arc<dyn LocationTransport> = transport;
        let registration = Registration::new_one_shot(
            key,
            request,
            identity,
            permission_level,
            location_transport,
        );

        let mut tasks = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            if !inner.started {
                return Err(ManagerError::NotStarted);
            }
            self.put_registration_locked(&mut inner, &mut tasks, registration);

            // a one-shot that never activated will not receive anything, so
            // fail it immediately
            if let Some(idx) = position_of(&inner, key) {
                if !inner.registrations[idx].active {
                    self.try_deliver_locked(&mut inner, &mut tasks, idx, None);
                }
            }
        }
        self.dispatch(tasks);
        Ok(CancellationHandle {
            manager: self.weak_self.clone(),
            key,
        })
    }

    /// Last known location for this caller, permission-leveled and gated.
    pub fn get_last_location(
        &self,
        identity: &CallerIdentity,
        permission_level: PermissionLevel,
        ignore_settings: bool,
    ) -> Option<Location> {
        let mut tasks = Vec::new();
        let result;
        {
            let mut inner = self.inner.lock().unwrap();
            result = self.get_last_location_locked(
                &mut inner,
                &mut tasks,
                identity,
                permission_level,
                ignore_settings,
            );
        }
        self.dispatch(tasks);
        result
    }

    fn get_last_location_locked(
        &self,
        inner: &mut Inner,
        tasks: &mut Vec<DeliveryTask>,
        identity: &CallerIdentity,
        permission_level: PermissionLevel,
        ignore_settings: bool,
    ) -> Option<Location> {
        if self
            .settings
            .is_package_blacklisted(identity.user_id, &identity.package)
        {
            return None;
        }
        if !ignore_settings {
            if !self.is_enabled_locked(inner, tasks, identity.user_id) {
                return None;
            }
            if !identity.system && !self.users.is_current_user(identity.user_id) {
                return None;
            }
        }
        if !self.app_ops.note_op(permission_level, identity) {
            return None;
        }

        let raw = self.get_last_location_unsafe_locked(
            inner,
            UserScope::Single(identity.user_id),
            permission_level,
            ignore_settings,
            u64::MAX,
        )?;
        self.permitted_location(raw, permission_level)
    }

    /// Seed the cache, but only when no fine normal-slot entry exists.
    pub fn inject_last_location(&self, location: Location, user_id: UserId) {
        let mut tasks = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            if !inner.started {
                return;
            }
            let existing = self.get_last_location_unsafe_locked(
                &inner,
                UserScope::Single(user_id),
                PermissionLevel::Fine,
                false,
                u64::MAX,
            );
            if existing.is_none() {
                self.set_last_location_locked(
                    &mut inner,
                    &mut tasks,
                    &location,
                    UserScope::Single(user_id),
                );
            }
        }
        self.dispatch(tasks);
    }

    pub fn is_enabled(&self, user_id: UserId) -> bool {
        let mut tasks = Vec::new();
        let enabled;
        {
            let mut inner = self.inner.lock().unwrap();
            enabled = self.is_enabled_locked(&mut inner, &mut tasks, user_id);
        }
        self.dispatch(tasks);
        enabled
    }

    pub fn add_enabled_listener(&self, listener: Arc<dyn ProviderEnabledListener>) -> ListenerId {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_enabled_listener_id;
        inner.next_enabled_listener_id += 1;
        inner.enabled_listeners.push((id, listener));
        id
    }

    pub fn remove_enabled_listener(&self, id: ListenerId) {
        let mut inner = self.inner.lock().unwrap();
        inner.enabled_listeners.retain(|(i, _)| *i != id);
    }

    /// Snapshot of the manager state for diagnostics.
    pub fn dump(&self) -> String {
        let inner = self.inner.lock().unwrap();
        let mut out = String::new();
        let _ = write!(out, "{} provider", self.name);
        if inner.provider.is_mock() {
            out.push_str(" [mock]");
        }
        let _ = writeln!(out, ":");
        let _ = writeln!(out, "  request: {}", inner.provider.current_request());

        for user_id in self.users.running_user_ids() {
            let enabled = inner.enabled.get(&user_id).copied().unwrap_or(false);
            let last = inner
                .last_locations
                .get(&user_id)
                .and_then(|c| c.get(PermissionLevel::Fine, false))
                .map(|l| l.to_string())
                .unwrap_or_else(|| "none".to_string());
            let _ = writeln!(out, "  user {}: enabled={} last={}", user_id, enabled, last);
        }

        if !inner.registrations.is_empty() {
            let _ = writeln!(out, "  registrations:");
            for registration in &inner.registrations {
                let _ = writeln!(out, "    {}", registration.describe());
            }
        }

        let records = self.event_log.snapshot();
        if !records.is_empty() {
            let _ = writeln!(out, "  events:");
            for record in records {
                let _ = writeln!(out, "    {} {}", record.at.format("%H:%M:%S%.3f"), record.event);
            }
        }
        out
    }

    // ------------------------------------------------------------------
    // policy reactions (called via PolicyBridge)
    // ------------------------------------------------------------------

    fn handle_location_enabled_changed(&self, user_id: UserId) {
        let mut tasks = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            if !inner.started {
                return;
            }
            self.on_enabled_changed_locked(&mut inner, &mut tasks, UserScope::Single(user_id));
        }
        self.dispatch(tasks);
    }

    /// Settings inputs of the effective request changed; recompute every
    /// registration.
    fn handle_request_inputs_changed(&self) {
        let mut tasks = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            if !inner.started {
                return;
            }
            self.update_registrations_locked(&mut inner, &mut tasks, &mut |reg| {
                let effective =
                    reg.compute_effective(self.settings.as_ref(), self.providers.as_ref());
                if effective != reg.effective {
                    reg.effective = effective;
                    true
                } else {
                    false
                }
            });
        }
        self.dispatch(tasks);
    }

    fn handle_user_policy_changed(&self, user_id: UserId) {
        let mut tasks = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            if !inner.started {
                return;
            }
            self.update_registrations_locked(&mut inner, &mut tasks, &mut |reg| {
                reg.identity.user_id == user_id
            });
        }
        self.dispatch(tasks);
    }

    fn handle_user_started(&self, user_id: UserId) {
        let mut tasks = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            if !inner.started {
                return;
            }
            // forget the prior state so the new observation is silent
            inner.enabled.remove(&user_id);
            self.on_enabled_changed_locked(&mut inner, &mut tasks, UserScope::Single(user_id));
        }
        self.dispatch(tasks);
    }

    fn handle_user_stopped(&self, user_id: UserId) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.started {
            return;
        }
        inner.enabled.remove(&user_id);
        inner.last_locations.remove(&user_id);
    }

    fn handle_permissions_changed_for_package(&self, package: &str) {
        let mut tasks = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            if !inner.started {
                return;
            }
            self.update_registrations_locked(&mut inner, &mut tasks, &mut |reg| {
                if reg.identity.package != package {
                    return false;
                }
                self.refresh_permitted(reg)
            });
        }
        self.dispatch(tasks);
    }

    fn handle_permissions_changed_for_uid(&self, uid: u32) {
        let mut tasks = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            if !inner.started {
                return;
            }
            self.update_registrations_locked(&mut inner, &mut tasks, &mut |reg| {
                if reg.identity.uid != uid {
                    return false;
                }
                self.refresh_permitted(reg)
            });
        }
        self.dispatch(tasks);
    }

    fn refresh_permitted(&self, reg: &mut Registration) -> bool {
        let permitted = self
            .permissions
            .has_location_permissions(reg.permission_level, &reg.identity);
        if permitted != reg.permitted {
            debug!(
                provider = %self.name,
                identity = %reg.identity,
                permitted,
                "permission state changed"
            );
            reg.permitted = permitted;
            true
        } else {
            false
        }
    }

    fn handle_foreground_changed(&self, uid: u32, foreground: bool) {
        let mut tasks = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            if !inner.started {
                return;
            }
            let foreground_only = self.power_save.mode() == PowerSaveMode::ForegroundOnly;
            self.update_registrations_locked(&mut inner, &mut tasks, &mut |reg| {
                if reg.identity.uid != uid || reg.foreground == foreground {
                    return false;
                }
                debug!(
                    provider = %self.name,
                    identity = %reg.identity,
                    foreground,
                    "foreground state changed"
                );
                reg.foreground = foreground;
                let effective =
                    reg.compute_effective(self.settings.as_ref(), self.providers.as_ref());
                let changed = effective != reg.effective;
                if changed {
                    reg.effective = effective;
                }
                changed || foreground_only
            });
        }
        self.dispatch(tasks);
    }

    fn handle_power_save_mode_changed(&self) {
        let mut tasks = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            if !inner.started {
                return;
            }
            // rare, so re-evaluate everything
            self.update_registrations_locked(&mut inner, &mut tasks, &mut |_| true);
        }
        self.dispatch(tasks);
    }

    fn handle_screen_interactive_changed(&self) {
        let affected = match self.power_save.mode() {
            PowerSaveMode::GpsDisabledWhenScreenOff => self.name == GPS_PROVIDER,
            PowerSaveMode::ThrottleRequestsWhenScreenOff
            | PowerSaveMode::AllDisabledWhenScreenOff => true,
            PowerSaveMode::NoChange | PowerSaveMode::ForegroundOnly => false,
        };
        if !affected {
            return;
        }
        let mut tasks = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            if !inner.started {
                return;
            }
            self.update_registrations_locked(&mut inner, &mut tasks, &mut |_| true);
        }
        self.dispatch(tasks);
    }

    // ------------------------------------------------------------------
    // registration bookkeeping (all under the lock)
    // ------------------------------------------------------------------

    fn put_registration_locked(
        &self,
        inner: &mut Inner,
        tasks: &mut Vec<DeliveryTask>,
        mut registration: Registration,
    ) {
        // replacement inherits the last delivered location so the merged
        // request can still be delayed
        if let Some(pos) = position_of(inner, registration.key) {
            let old = self.detach_registration_locked(inner, pos);
            registration.last_delivered = old.last_delivered;
        }

        // make sure this user's enabled state is known before eligibility
        // is computed
        let user_id = registration.identity.user_id;
        let _ = self.is_enabled_locked(inner, tasks, user_id);

        registration.permitted = self
            .permissions
            .has_location_permissions(registration.permission_level, &registration.identity);
        registration.foreground = self.foreground.is_app_foreground(registration.identity.uid);
        registration.effective =
            registration.compute_effective(self.settings.as_ref(), self.providers.as_ref());

        debug!(
            provider = %self.name,
            registration = %registration.describe(),
            "adding registration"
        );
        self.event_log.log(Event::ClientRegistered {
            identity: registration.identity.clone(),
            request: registration.request.to_string(),
        });

        let now = time::elapsed_realtime_millis();
        registration.expiration_realtime_ms = registration.request.expiration_realtime_ms(now);
        let key = registration.key;
        let instance = registration.instance;
        let already_expired = registration.expiration_realtime_ms <= now;

        if !already_expired && registration.expiration_realtime_ms < u64::MAX {
            let weak = self.weak_self.clone();
            let token = self.alarms.set_delayed_alarm(
                registration.expiration_realtime_ms - now,
                &registration.request.work_source,
                Box::new(move || {
                    if let Some(manager) = weak.upgrade() {
                        manager.on_expiration_alarm(key, instance);
                    }
                }),
            );
            registration.expiration_alarm = Some(token);
        }

        // continuous clients learn immediately when the provider is off
        if let RegistrationKind::Continuous {
            provider_transport, ..
        } = &registration.kind
        {
            if !self.is_enabled_locked(inner, tasks, user_id) {
                tasks.push(DeliveryTask::Enabled {
                    key,
                    transport: Arc::clone(provider_transport),
                    enabled: false,
                });
            }
        }

        let one_shot = !registration.is_continuous();
        inner.registrations.push(registration);
        let idx = inner.registrations.len() - 1;

        if already_expired {
            if one_shot {
                self.try_deliver_locked(inner, tasks, idx, None);
            } else {
                self.remove_registration_locked(inner, tasks, key);
            }
        } else {
            self.refresh_active_locked(inner, tasks, idx);
        }

        self.update_service_locked(inner);
    }

    /// Remove from the table and tear down, without a service update.
    fn detach_registration_locked(&self, inner: &mut Inner, pos: usize) -> Registration {
        let mut registration = inner.registrations.remove(pos);
        if registration.active {
            registration.active = false;
            let properties = inner.provider.state().properties;
            self.update_high_power_locked(&mut registration, properties);
            if !registration.effective.hidden_from_app_ops {
                self.attribution.report_location_stop(
                    &registration.identity,
                    &self.name,
                    registration.key,
                );
            }
        }
        if let Some(token) = registration.expiration_alarm.take() {
            self.alarms.cancel(token);
        }
        debug!(
            provider = %self.name,
            identity = %registration.identity,
            "removed registration"
        );
        self.event_log.log(Event::ClientUnregistered {
            identity: registration.identity.clone(),
        });
        registration
    }

    fn remove_registration_locked(
        &self,
        inner: &mut Inner,
        _tasks: &mut Vec<DeliveryTask>,
        key: ClientKey,
    ) {
        let Some(pos) = position_of(inner, key) else {
            return;
        };
        let _ = self.detach_registration_locked(inner, pos);
        self.update_service_locked(inner);
    }

    /// Re-evaluate eligibility for registrations selected by `affected`,
    /// firing activation hooks and a single service update at the end.
    fn update_registrations_locked(
        &self,
        inner: &mut Inner,
        tasks: &mut Vec<DeliveryTask>,
        affected: &mut dyn FnMut(&mut Registration) -> bool,
    ) {
        let snapshot: Vec<(ClientKey, u64)> = inner
            .registrations
            .iter()
            .map(|r| (r.key, r.instance))
            .collect();

        for (key, instance) in snapshot {
            let Some(idx) = position_of_instance(inner, key, instance) else {
                continue;
            };
            if affected(&mut inner.registrations[idx]) {
                self.refresh_active_locked(inner, tasks, idx);
            }
        }

        self.update_service_locked(inner);
    }

    fn refresh_active_locked(&self, inner: &mut Inner, tasks: &mut Vec<DeliveryTask>, idx: usize) {
        let properties = inner.provider.state().properties;
        let new_active = self.compute_is_active_locked(inner, &inner.registrations[idx]);
        let registration = &mut inner.registrations[idx];

        if new_active == registration.active {
            self.update_high_power_locked(registration, properties);
            return;
        }

        if new_active {
            registration.active = true;
            if !registration.effective.hidden_from_app_ops {
                self.attribution.report_location_start(
                    &registration.identity,
                    &self.name,
                    registration.key,
                );
            }
            self.update_high_power_locked(registration, properties);
            self.on_became_active_locked(inner, tasks, idx);
        } else {
            registration.active = false;
            self.update_high_power_locked(registration, properties);
            if !registration.effective.hidden_from_app_ops {
                self.attribution.report_location_stop(
                    &registration.identity,
                    &self.name,
                    registration.key,
                );
            }
            self.on_became_inactive_locked(inner, tasks, idx);
        }
    }

    fn on_became_active_locked(
        &self,
        inner: &mut Inner,
        tasks: &mut Vec<DeliveryTask>,
        idx: usize,
    ) {
        let registration = &inner.registrations[idx];
        match registration.kind {
            RegistrationKind::Continuous { .. } => {
                if !registration.request.deliver_historical {
                    return;
                }
                // a fresh provider request may be delayed, so hand over a
                // historical location when one is applicable
                let mut max_age_ms = registration.effective.interval_ms;
                if let Some(last) = &registration.last_delivered {
                    max_age_ms = max_age_ms.min(last.age_millis().saturating_sub(1));
                }
                if max_age_ms <= MIN_REQUEST_DELAY_MS {
                    return;
                }
                let lookup = self.get_last_location_unsafe_locked(
                    inner,
                    UserScope::Single(registration.identity.user_id),
                    registration.permission_level,
                    registration.effective.location_settings_ignored,
                    max_age_ms,
                );
                if let Some(location) = lookup {
                    self.try_deliver_locked(inner, tasks, idx, Some(location));
                }
            }
            RegistrationKind::OneShot => {
                let lookup = self.get_last_location_unsafe_locked(
                    inner,
                    UserScope::Single(registration.identity.user_id),
                    registration.permission_level,
                    registration.effective.location_settings_ignored,
                    MAX_CURRENT_LOCATION_AGE_MS,
                );
                if let Some(location) = lookup {
                    self.try_deliver_locked(inner, tasks, idx, Some(location));
                }
            }
        }
    }

    fn on_became_inactive_locked(
        &self,
        inner: &mut Inner,
        tasks: &mut Vec<DeliveryTask>,
        idx: usize,
    ) {
        let registration = &inner.registrations[idx];
        if let RegistrationKind::OneShot = registration.kind {
            // an inactive one-shot will never be satisfied, so fail fast -
            // unless it is a bypass request, which keeps waiting
            if !registration.effective.location_settings_ignored {
                self.try_deliver_locked(inner, tasks, idx, None);
            }
        }
    }

    fn compute_is_active_locked(&self, inner: &Inner, registration: &Registration) -> bool {
        if !registration.permitted {
            return false;
        }
        let identity = &registration.identity;

        if !registration.effective.location_settings_ignored {
            if !inner.enabled.get(&identity.user_id).copied().unwrap_or(false) {
                return false;
            }
            if !identity.system && !self.users.is_current_user(identity.user_id) {
                return false;
            }
            match self.power_save.mode() {
                PowerSaveMode::ForegroundOnly => {
                    if !registration.foreground {
                        return false;
                    }
                }
                PowerSaveMode::GpsDisabledWhenScreenOff => {
                    if self.name == GPS_PROVIDER && !self.screen.is_interactive() {
                        return false;
                    }
                }
                PowerSaveMode::ThrottleRequestsWhenScreenOff
                | PowerSaveMode::AllDisabledWhenScreenOff => {
                    if !self.screen.is_interactive() {
                        return false;
                    }
                }
                PowerSaveMode::NoChange => {}
            }
            if self
                .settings
                .is_package_blacklisted(identity.user_id, &identity.package)
            {
                return false;
            }
        }

        true
    }

    fn update_high_power_locked(
        &self,
        registration: &mut Registration,
        properties: Option<ProviderProperties>,
    ) {
        let using = registration.active
            && registration.effective.interval_ms < MAX_HIGH_POWER_INTERVAL_MS
            && properties
                .map(|p| p.power_requirement == PowerRequirement::High)
                .unwrap_or(false);
        if using == registration.using_high_power {
            return;
        }
        registration.using_high_power = using;
        if registration.effective.hidden_from_app_ops {
            return;
        }
        if using {
            self.attribution.report_high_power_start(
                &registration.identity,
                &self.name,
                registration.key,
            );
        } else {
            self.attribution.report_high_power_stop(
                &registration.identity,
                &self.name,
                registration.key,
            );
        }
    }

    // ------------------------------------------------------------------
    // acceptance and delivery
    // ------------------------------------------------------------------

    fn try_deliver_locked(
        &self,
        inner: &mut Inner,
        tasks: &mut Vec<DeliveryTask>,
        idx: usize,
        fine: Option<Location>,
    ) {
        let key = inner.registrations[idx].key;
        match self.accept_location_change_locked(inner, idx, fine) {
            AcceptOutcome::Deliver { task, remove } => {
                tasks.push(task);
                if remove {
                    self.remove_registration_locked(inner, tasks, key);
                }
            }
            AcceptOutcome::Expired => {
                debug!(provider = %self.name, %key, "removing registration due to expiration");
                self.remove_registration_locked(inner, tasks, key);
            }
            AcceptOutcome::Rejected => {}
        }
    }

    fn accept_location_change_locked(
        &self,
        inner: &mut Inner,
        idx: usize,
        fine: Option<Location>,
    ) -> AcceptOutcome {
        let now = time::elapsed_realtime_millis();
        let registration = &mut inner.registrations[idx];

        match &mut registration.kind {
            RegistrationKind::Continuous { wakelock, .. } => {
                let Some(fine) = fine else {
                    return AcceptOutcome::Rejected;
                };

                // the alarm is not guaranteed to fire on time, especially
                // for short intervals, so re-check expiration here
                if now >= registration.expiration_realtime_ms {
                    return AcceptOutcome::Expired;
                }

                let location = match registration.permission_level {
                    PermissionLevel::Fine => fine,
                    PermissionLevel::Coarse => self.fudger.create_coarse(&fine),
                };

                if let Some(last) = &registration.last_delivered {
                    let delta_ms = location.elapsed_realtime_millis() as i64
                        - last.elapsed_realtime_millis() as i64;
                    let max_jitter_ms = ((FASTEST_INTERVAL_JITTER_PERCENTAGE
                        * registration.effective.interval_ms as f64)
                        as u64)
                        .min(MAX_FASTEST_INTERVAL_JITTER_MS);
                    let floor_ms = registration
                        .effective
                        .resolved_min_update_interval_ms()
                        .saturating_sub(max_jitter_ms);
                    if delta_ms < floor_ms as i64 {
                        return AcceptOutcome::Rejected;
                    }

                    let min_distance = registration.effective.min_update_distance_m;
                    if min_distance > 0.0 && location.distance_to(last) <= min_distance as f64 {
                        return AcceptOutcome::Rejected;
                    }
                }

                if !self
                    .app_ops
                    .note_op(registration.permission_level, &registration.identity)
                {
                    debug!(provider = %self.name, identity = %registration.identity, "app op denied");
                    return AcceptOutcome::Rejected;
                }

                // mock locations do not earn a wakelock
                let use_wakelock = !location.from_mock;
                registration.last_delivered = Some(location.clone());
                let completion = if use_wakelock {
                    wakelock.acquire(WAKELOCK_TIMEOUT_MS);
                    let wakelock = wakelock.clone();
                    Some(SingleUseCallback::new(move || wakelock.release()))
                } else {
                    None
                };

                AcceptOutcome::Deliver {
                    task: DeliveryTask::Location {
                        key: registration.key,
                        identity: registration.identity.clone(),
                        transport: Arc::clone(&registration.transport),
                        location,
                        completion,
                    },
                    remove: false,
                }
            }
            RegistrationKind::OneShot => {
                let mut fine = fine;
                if now >= registration.expiration_realtime_ms {
                    fine = None;
                }
                if !self
                    .app_ops
                    .note_op(registration.permission_level, &registration.identity)
                {
                    debug!(provider = %self.name, identity = %registration.identity, "app op denied");
                    fine = None;
                }
                let location =
                    fine.and_then(|f| self.permitted_location(f, registration.permission_level));

                AcceptOutcome::Deliver {
                    task: DeliveryTask::OneShot {
                        key: registration.key,
                        identity: registration.identity.clone(),
                        transport: Arc::clone(&registration.transport),
                        location,
                    },
                    remove: true,
                }
            }
        }
    }

    fn permitted_location(
        &self,
        fine: Location,
        permission_level: PermissionLevel,
    ) -> Option<Location> {
        match permission_level {
            PermissionLevel::Fine => Some(fine),
            PermissionLevel::Coarse => Some(self.fudger.create_coarse(&fine)),
        }
    }

    fn report_location_locked(
        &self,
        inner: &mut Inner,
        tasks: &mut Vec<DeliveryTask>,
        location: Location,
    ) {
        if !location.from_mock && location.latitude == 0.0 && location.longitude == 0.0 {
            warn!(provider = %self.name, "blocking 0,0 location");
            return;
        }
        if !location.is_complete() {
            warn!(provider = %self.name, "blocking incomplete location");
            return;
        }

        // receipt of passive locations is too spammy to log
        if self.name != PASSIVE_PROVIDER {
            self.event_log.log(Event::LocationReceived);
        }

        // cache first, then fan out: a transport that reads the last
        // location during delivery sees this fix
        self.set_last_location_locked(inner, tasks, &location, UserScope::All);

        let snapshot: Vec<(ClientKey, u64)> = inner
            .registrations
            .iter()
            .map(|r| (r.key, r.instance))
            .collect();
        for (key, instance) in snapshot {
            let Some(idx) = position_of_instance(inner, key, instance) else {
                continue;
            };
            if inner.registrations[idx].active {
                self.try_deliver_locked(inner, tasks, idx, Some(location.clone()));
            }
        }

        if let Some(passive) = &self.passive {
            passive.update_location(&location);
        }
    }

    // ------------------------------------------------------------------
    // last location cache
    // ------------------------------------------------------------------

    fn set_last_location_locked(
        &self,
        inner: &mut Inner,
        tasks: &mut Vec<DeliveryTask>,
        location: &Location,
        scope: UserScope,
    ) {
        match scope {
            UserScope::All => {
                for user_id in self.users.running_user_ids() {
                    self.set_last_location_locked(
                        inner,
                        tasks,
                        location,
                        UserScope::Single(user_id),
                    );
                }
            }
            UserScope::Single(user_id) => {
                let enabled = self.is_enabled_locked(inner, tasks, user_id);
                let cache = inner.last_locations.entry(user_id).or_default();
                if enabled {
                    cache.set(location);
                }
                cache.set_bypass(location);
            }
        }
    }

    /// Raw cache read: no permission or gating checks, and the result is
    /// not coarsened. Callers are responsible for both.
    fn get_last_location_unsafe_locked(
        &self,
        inner: &Inner,
        scope: UserScope,
        permission_level: PermissionLevel,
        ignore_settings: bool,
        max_age_ms: u64,
    ) -> Option<Location> {
        match scope {
            UserScope::All => {
                let mut best: Option<Location> = None;
                for user_id in self.users.running_user_ids() {
                    let next = self.get_last_location_unsafe_locked(
                        inner,
                        UserScope::Single(user_id),
                        permission_level,
                        ignore_settings,
                        max_age_ms,
                    );
                    best = match (best, next) {
                        (None, next) => next,
                        (Some(best), Some(next))
                            if next.elapsed_realtime_nanos > best.elapsed_realtime_nanos =>
                        {
                            Some(next)
                        }
                        (best, _) => best,
                    };
                }
                best
            }
            UserScope::Single(user_id) => {
                let location = inner
                    .last_locations
                    .get(&user_id)?
                    .get(permission_level, ignore_settings)?;
                if location.age_millis() > max_age_ms {
                    return None;
                }
                Some(location.clone())
            }
        }
    }

    // ------------------------------------------------------------------
    // enabled state machine
    // ------------------------------------------------------------------

    fn is_enabled_locked(
        &self,
        inner: &mut Inner,
        tasks: &mut Vec<DeliveryTask>,
        user_id: UserId,
    ) -> bool {
        if let Some(enabled) = inner.enabled.get(&user_id) {
            return *enabled;
        }
        // possible when user notifications race with lookups
        warn!(provider = %self.name, user_id, "saw user unexpectedly");
        self.on_enabled_changed_locked(inner, tasks, UserScope::Single(user_id));
        inner.enabled.get(&user_id).copied().unwrap_or(false)
    }

    fn on_enabled_changed_locked(
        &self,
        inner: &mut Inner,
        tasks: &mut Vec<DeliveryTask>,
        scope: UserScope,
    ) {
        let user_id = match scope {
            UserScope::All => {
                for user_id in self.users.running_user_ids() {
                    self.on_enabled_changed_locked(inner, tasks, UserScope::Single(user_id));
                }
                return;
            }
            UserScope::Single(user_id) => user_id,
        };

        let enabled = inner.started
            && inner.provider.state().allowed
            && self.settings.is_location_enabled(user_id);

        let was_enabled = inner.enabled.get(&user_id).copied();
        if was_enabled == Some(enabled) {
            return;
        }
        inner.enabled.insert(user_id, enabled);

        // skip logging unknown -> false transitions for brevity
        if was_enabled.is_some() || enabled {
            debug!(provider = %self.name, user_id, enabled, "provider enabled changed");
            self.event_log.log(Event::EnabledChanged { user_id, enabled });
        }

        if !enabled {
            if let Some(cache) = inner.last_locations.get_mut(&user_id) {
                cache.clear_normal();
            }
        }

        // no change notifications the first time a user is seen
        if was_enabled.is_some() {
            // fused and passive never get public updates, for legacy reasons
            if self.name != FUSED_PROVIDER && self.name != PASSIVE_PROVIDER {
                tasks.push(DeliveryTask::Broadcast { user_id, enabled });
            }

            let listeners: Vec<Arc<dyn ProviderEnabledListener>> = inner
                .enabled_listeners
                .iter()
                .map(|(_, l)| Arc::clone(l))
                .collect();
            if !listeners.is_empty() {
                tasks.push(DeliveryTask::EnabledListeners {
                    listeners,
                    user_id,
                    enabled,
                });
            }

            for registration in &inner.registrations {
                if registration.identity.user_id != user_id
                    || registration.effective.location_settings_ignored
                {
                    continue;
                }
                if let RegistrationKind::Continuous {
                    provider_transport, ..
                } = &registration.kind
                {
                    tasks.push(DeliveryTask::Enabled {
                        key: registration.key,
                        transport: Arc::clone(provider_transport),
                        enabled,
                    });
                }
            }
        }

        self.update_registrations_locked(inner, tasks, &mut |reg| {
            reg.identity.user_id == user_id
        });
    }

    // ------------------------------------------------------------------
    // merged provider request
    // ------------------------------------------------------------------

    fn merged_request_locked(&self, inner: &Inner) -> ProviderRequest {
        let mut interval_ms = INTERVAL_DISABLED;
        let mut quality = Quality::LowPower;
        let mut location_settings_ignored = false;
        let mut low_power = true;

        for registration in inner.registrations.iter().filter(|r| r.active) {
            let effective = &registration.effective;
            // passive requests observe without driving the provider
            if effective.is_passive() {
                continue;
            }
            interval_ms = interval_ms.min(effective.interval_ms);
            quality = quality.max(effective.quality);
            location_settings_ignored |= effective.location_settings_ignored;
            low_power &= effective.low_power;
        }

        if interval_ms == INTERVAL_DISABLED {
            return ProviderRequest::disabled();
        }

        // spread power blame across the registrations near the chosen
        // interval, since the work source cannot express ratios
        let threshold_ms = interval_ms
            .checked_add(1000)
            .map(|v| v / 2)
            .and_then(|v| v.checked_mul(3))
            .unwrap_or(PASSIVE_INTERVAL - 1);

        let mut work_source = WorkSource::new();
        for registration in inner.registrations.iter().filter(|r| r.active) {
            if registration.effective.interval_ms <= threshold_ms {
                work_source.add(&registration.effective.work_source);
            }
        }

        ProviderRequest {
            interval_ms,
            quality,
            low_power,
            location_settings_ignored,
            work_source,
        }
    }

    fn update_service_locked(&self, inner: &mut Inner) {
        let new = self.merged_request_locked(inner);
        if new == inner.merged {
            return;
        }
        let old = std::mem::replace(&mut inner.merged, new.clone());

        // a superseded delayed registration never applies
        if let Some((_, token)) = inner.delayed_register.take() {
            self.alarms.cancel(token);
        }

        if new.is_disabled() {
            self.event_log.log(Event::UpdateRequest {
                request: new.to_string(),
            });
            inner.provider.set_request(new);
            return;
        }

        let delay_ms = if !old.location_settings_ignored && new.location_settings_ignored {
            0
        } else if new.interval_ms > old.interval_ms {
            // an increased interval reaches the provider immediately so it
            // can save power
            0
        } else {
            self.calculate_request_delay_locked(inner, new.interval_ms)
        };

        if delay_ms < MIN_REQUEST_DELAY_MS {
            self.event_log.log(Event::UpdateRequest {
                request: new.to_string(),
            });
            inner.provider.set_request(new);
        } else {
            debug!(
                provider = %self.name,
                delay_ms,
                request = %new,
                "delaying provider request update"
            );
            inner.delayed_generation += 1;
            let generation = inner.delayed_generation;
            let weak = self.weak_self.clone();
            let request = new.clone();
            let token = self.alarms.set_delayed_alarm(
                delay_ms,
                &new.work_source,
                Box::new(move || {
                    if let Some(manager) = weak.upgrade() {
                        manager.on_delayed_register(generation, request);
                    }
                }),
            );
            inner.delayed_register = Some((generation, token));
        }
    }

    /// How long the new request can be held back, assuming the provider
    /// will deliver immediately once it receives it.
    fn calculate_request_delay_locked(&self, inner: &Inner, new_interval_ms: u64) -> u64 {
        let mut delay_ms = new_interval_ms;
        for registration in inner.registrations.iter().filter(|r| r.active) {
            if delay_ms == 0 {
                break;
            }
            let effective = &registration.effective;

            let mut last = registration.last_delivered.clone();
            if last.is_none() && !effective.location_settings_ignored {
                // pretend never-served registrations already got the last
                // applicable cached location, else rapid add/remove churn
                // defeats the delay
                last = self.get_last_location_unsafe_locked(
                    inner,
                    UserScope::Single(registration.identity.user_id),
                    registration.permission_level,
                    false,
                    effective.interval_ms,
                );
            }

            let registration_delay_ms = match last {
                None => 0,
                Some(last) => effective.interval_ms.saturating_sub(last.age_millis()),
            };
            delay_ms = delay_ms.min(registration_delay_ms);
        }
        delay_ms
    }

    fn on_delayed_register(&self, generation: u64, request: ProviderRequest) {
        let mut inner = self.inner.lock().unwrap();
        match inner.delayed_register {
            Some((pending, _)) if pending == generation => {
                inner.delayed_register = None;
                self.event_log.log(Event::UpdateRequest {
                    request: request.to_string(),
                });
                inner.provider.set_request(request);
            }
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // alarm and delivery completions
    // ------------------------------------------------------------------

    fn on_expiration_alarm(&self, key: ClientKey, instance: u64) {
        let mut tasks = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            let Some(idx) = position_of_instance(&inner, key, instance) else {
                return;
            };
            debug!(provider = %self.name, %key, "registration expired");
            inner.registrations[idx].expiration_alarm = None;
            if inner.registrations[idx].is_continuous() {
                self.remove_registration_locked(&mut inner, &mut tasks, key);
            } else {
                // deliver the give-up null; acceptance handles removal
                inner.registrations[idx].expiration_realtime_ms = u64::MAX;
                self.try_deliver_locked(&mut inner, &mut tasks, idx, None);
            }
        }
        self.dispatch(tasks);
    }

    fn finish_continuous_delivery(
        &self,
        key: ClientKey,
        identity: CallerIdentity,
        success: bool,
        completion: Option<Arc<SingleUseCallback>>,
    ) {
        let mut tasks = Vec::new();
        if success {
            self.event_log.log(Event::LocationDelivered { identity });
            let mut inner = self.inner.lock().unwrap();
            let mut reached_max = false;
            if let Some(idx) = position_of(&inner, key) {
                let registration = &mut inner.registrations[idx];
                let max_updates = registration.effective.max_updates;
                if let RegistrationKind::Continuous { num_delivered, .. } = &mut registration.kind {
                    *num_delivered += 1;
                    reached_max = *num_delivered >= max_updates;
                }
            }
            if reached_max {
                debug!(provider = %self.name, %key, "max updates reached");
                self.remove_registration_locked(&mut inner, &mut tasks, key);
            }
        } else {
            warn!(provider = %self.name, identity = %identity, "removing registration after transport failure");
            // the client never saw the completion callback
            if let Some(completion) = completion {
                completion.invoke();
            }
            let mut inner = self.inner.lock().unwrap();
            self.remove_registration_locked(&mut inner, &mut tasks, key);
        }
        self.dispatch(tasks);
    }

    fn finish_oneshot_delivery(&self, key: ClientKey, identity: CallerIdentity, success: bool) {
        let mut tasks = Vec::new();
        if success {
            self.event_log.log(Event::LocationDelivered { identity });
        } else {
            warn!(provider = %self.name, identity = %identity, "one-shot transport failure");
        }
        {
            let mut inner = self.inner.lock().unwrap();
            self.remove_registration_locked(&mut inner, &mut tasks, key);
        }
        self.dispatch(tasks);
    }

    fn remove_for_transport_failure(&self, key: ClientKey) {
        let mut tasks = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            self.remove_registration_locked(&mut inner, &mut tasks, key);
        }
        self.dispatch(tasks);
    }

    fn dispatch(&self, tasks: Vec<DeliveryTask>) {
        for task in tasks {
            let weak = self.weak_self.clone();
            match task {
                DeliveryTask::Location {
                    key,
                    identity,
                    transport,
                    location,
                    completion,
                } => {
                    self.executor.execute(move || {
                        let result = transport.deliver_location(Some(location), completion.clone());
                        if let Some(manager) = weak.upgrade() {
                            manager.finish_continuous_delivery(
                                key,
                                identity,
                                result.is_ok(),
                                completion,
                            );
                        }
                    });
                }
                DeliveryTask::OneShot {
                    key,
                    identity,
                    transport,
                    location,
                } => {
                    self.executor.execute(move || {
                        let result = transport.deliver_location(location, None);
                        if let Some(manager) = weak.upgrade() {
                            manager.finish_oneshot_delivery(key, identity, result.is_ok());
                        }
                    });
                }
                DeliveryTask::Enabled {
                    key,
                    transport,
                    enabled,
                } => {
                    let name = self.name.clone();
                    self.executor.execute(move || {
                        if transport.deliver_provider_enabled(&name, enabled).is_err() {
                            if let Some(manager) = weak.upgrade() {
                                manager.remove_for_transport_failure(key);
                            }
                        }
                    });
                }
                DeliveryTask::EnabledListeners {
                    listeners,
                    user_id,
                    enabled,
                } => {
                    let name = self.name.clone();
                    self.executor.execute(move || {
                        for listener in listeners {
                            listener.on_provider_enabled_changed(&name, user_id, enabled);
                        }
                    });
                }
                DeliveryTask::Broadcast { user_id, enabled } => {
                    let name = self.name.clone();
                    let broadcaster = Arc::clone(&self.broadcaster);
                    self.executor.execute(move || {
                        broadcaster.send_providers_changed(user_id, &name, enabled);
                    });
                }
            }
        }
    }
}

fn validate_request(request: &LocationRequest) -> Result<(), ManagerError> {
    if request.work_source.is_empty() {
        return Err(ManagerError::EmptyWorkSource);
    }
    if request.max_updates == 0 {
        return Err(ManagerError::InvalidMaxUpdates);
    }
    Ok(())
}

fn position_of(inner: &Inner, key: ClientKey) -> Option<usize> {
    inner.registrations.iter().position(|r| r.key == key)
}

fn position_of_instance(inner: &Inner, key: ClientKey, instance: u64) -> Option<usize> {
    inner
        .registrations
        .iter()
        .position(|r| r.key == key && r.instance == instance)
}

/// Routes every policy callback back into the manager under its lock.
struct PolicyBridge {
    manager: Weak<LocationProviderManager>,
}

impl PolicyBridge {
    fn with(&self, f: impl FnOnce(&LocationProviderManager)) {
        if let Some(manager) = self.manager.upgrade() {
            f(&manager);
        }
    }
}

impl SettingsListener for PolicyBridge {
    fn on_location_enabled_changed(&self, user_id: UserId) {
        self.with(|m| m.handle_location_enabled_changed(user_id));
    }

    fn on_background_throttle_interval_changed(&self) {
        self.with(|m| m.handle_request_inputs_changed());
    }

    fn on_background_throttle_whitelist_changed(&self) {
        self.with(|m| m.handle_request_inputs_changed());
    }

    fn on_ignore_settings_whitelist_changed(&self) {
        self.with(|m| m.handle_request_inputs_changed());
    }

    fn on_blacklist_changed(&self, user_id: UserId) {
        self.with(|m| m.handle_user_policy_changed(user_id));
    }
}

impl UserListener for PolicyBridge {
    fn on_user_changed(&self, user_id: UserId, change: UserChange) {
        self.with(|m| match change {
            UserChange::Started => m.handle_user_started(user_id),
            UserChange::Stopped => m.handle_user_stopped(user_id),
            UserChange::CurrentChanged => m.handle_user_policy_changed(user_id),
        });
    }
}

impl PermissionsListener for PolicyBridge {
    fn on_permissions_changed_for_package(&self, package: &str) {
        self.with(|m| m.handle_permissions_changed_for_package(package));
    }

    fn on_permissions_changed_for_uid(&self, uid: u32) {
        self.with(|m| m.handle_permissions_changed_for_uid(uid));
    }
}

impl ForegroundListener for PolicyBridge {
    fn on_foreground_changed(&self, uid: u32, foreground: bool) {
        self.with(|m| m.handle_foreground_changed(uid, foreground));
    }
}

impl PowerSaveModeListener for PolicyBridge {
    fn on_power_save_mode_changed(&self, _mode: PowerSaveMode) {
        self.with(|m| m.handle_power_save_mode_changed());
    }
}

impl ScreenListener for PolicyBridge {
    fn on_screen_interactive_changed(&self, _interactive: bool) {
        self.with(|m| m.handle_screen_interactive_changed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{InMemoryPermissions, InMemorySettings};
    use crate::provider::{MockProvider, ProviderProperties};
    use crate::transport::{channel_transport, ClientEvent};
    use std::sync::mpsc::Receiver;
    use std::time::Duration;

    fn fix(lat: f64, lon: f64) -> Location {
        Location::new("gps", lat, lon).with_accuracy(10.0)
    }

    fn recv_location(receiver: &Receiver<ClientEvent>) -> Option<Location> {
        match receiver.recv_timeout(Duration::from_secs(2)) {
            Ok(ClientEvent::Location { location, .. }) => location,
            Ok(other) => panic!("unexpected event: {:?}", other),
            Err(_) => panic!("no delivery within timeout"),
        }
    }

    struct Harness {
        manager: Arc<LocationProviderManager>,
        permissions: Arc<InMemoryPermissions>,
        settings: Arc<InMemorySettings>,
        provider: Arc<MockProvider>,
    }

    fn harness() -> Harness {
        let permissions = InMemoryPermissions::new();
        let settings = InMemorySettings::new();
        let provider = MockProvider::new(ProviderProperties::default());
        let manager = LocationProviderManager::builder("gps")
            .permissions(permissions.clone())
            .settings(settings.clone())
            .fudger_seed(12345)
            .build();
        manager.set_real_provider(Some(provider.clone()));
        manager.start_manager();
        Harness {
            manager,
            permissions,
            settings,
            provider,
        }
    }

    fn identity() -> CallerIdentity {
        CallerIdentity::new(0, 10001, 42, "com.example.app")
    }

    fn request(interval_ms: u64) -> LocationRequest {
        LocationRequest::new(interval_ms).with_work_source(WorkSource::single(10001, "com.example.app"))
    }

    #[test]
    fn test_register_before_start_fails() {
        let manager = LocationProviderManager::builder("gps").build();
        let (transport, _receiver) = channel_transport();
        let result = manager.register_location_request(
            ClientKey::next(),
            request(1_000),
            identity(),
            PermissionLevel::Fine,
            transport,
        );
        assert!(matches!(result, Err(ManagerError::NotStarted)));
    }

    #[test]
    fn test_empty_work_source_is_rejected() {
        let h = harness();
        let (transport, _receiver) = channel_transport();
        let result = h.manager.register_location_request(
            ClientKey::next(),
            LocationRequest::new(1_000),
            identity(),
            PermissionLevel::Fine,
            transport,
        );
        assert!(matches!(result, Err(ManagerError::EmptyWorkSource)));
    }

    #[test]
    fn test_mock_calls_require_mock_provider() {
        let h = harness();
        assert!(matches!(
            h.manager.set_mock_provider_allowed(false),
            Err(ManagerError::NotMockProvider(_))
        ));
        assert!(matches!(
            h.manager.set_mock_provider_location(fix(1.0, 2.0)),
            Err(ManagerError::NotMockProvider(_))
        ));
    }

    #[test]
    fn test_start_and_stop_are_idempotent() {
        let h = harness();
        h.manager.start_manager();
        assert!(h.manager.is_started());
        h.manager.stop_manager();
        h.manager.stop_manager();
        assert!(!h.manager.is_started());
        assert!(h.manager.current_request().is_disabled());
    }

    #[test]
    fn test_register_pushes_merged_request_and_delivers() {
        let h = harness();
        h.permissions.grant(10001, PermissionLevel::Fine);

        let (transport, receiver) = channel_transport();
        h.manager
            .register_location_request(
                ClientKey::next(),
                request(1_000),
                identity(),
                PermissionLevel::Fine,
                transport,
            )
            .unwrap();

        let merged = h.manager.current_request();
        assert_eq!(merged.interval_ms, 1_000);
        assert_eq!(h.provider.last_request().unwrap().interval_ms, 1_000);

        h.manager.on_report_location(fix(47.6, -122.3));
        let delivered = recv_location(&receiver).expect("expected a location");
        assert_eq!(delivered.latitude, 47.6);
    }

    #[test]
    fn test_unpermitted_registration_is_inactive() {
        let h = harness();
        let (transport, _receiver) = channel_transport();
        h.manager
            .register_location_request(
                ClientKey::next(),
                request(1_000),
                identity(),
                PermissionLevel::Fine,
                transport,
            )
            .unwrap();

        assert!(h.manager.current_request().is_disabled());
    }

    #[test]
    fn test_unregister_is_idempotent_and_disables() {
        let h = harness();
        h.permissions.grant(10001, PermissionLevel::Fine);

        let key = ClientKey::next();
        let (transport, _receiver) = channel_transport();
        h.manager
            .register_location_request(key, request(1_000), identity(), PermissionLevel::Fine, transport)
            .unwrap();
        assert!(!h.manager.current_request().is_disabled());

        h.manager.unregister_location_request(key);
        h.manager.unregister_location_request(key);
        assert!(h.manager.current_request().is_disabled());
    }

    #[test]
    fn test_replacement_under_same_key() {
        let h = harness();
        h.permissions.grant(10001, PermissionLevel::Fine);

        let key = ClientKey::next();
        let (transport_a, receiver_a) = channel_transport();
        h.manager
            .register_location_request(key, request(1_000), identity(), PermissionLevel::Fine, transport_a)
            .unwrap();

        h.manager.on_report_location(fix(47.6, -122.3));
        assert!(recv_location(&receiver_a).is_some());

        let (transport_b, receiver_b) = channel_transport();
        h.manager
            .register_location_request(key, request(2_000), identity(), PermissionLevel::Fine, transport_b)
            .unwrap();

        // the old transport is dead, the new one serves the key
        h.manager.on_report_location(
            fix(47.7, -122.3).with_elapsed_realtime_millis(time::elapsed_realtime_millis() + 5_000),
        );
        assert!(recv_location(&receiver_b).is_some());
        assert!(receiver_a.recv_timeout(Duration::from_millis(200)).is_err());
        assert_eq!(h.manager.current_request().interval_ms, 2_000);
    }

    #[test]
    fn test_blacklisted_package_gets_nothing() {
        let h = harness();
        h.permissions.grant(10001, PermissionLevel::Fine);
        h.settings.set_package_blacklisted(0, "com.example.app", true);

        let (transport, _receiver) = channel_transport();
        h.manager
            .register_location_request(
                ClientKey::next(),
                request(1_000),
                identity(),
                PermissionLevel::Fine,
                transport,
            )
            .unwrap();

        assert!(h.manager.current_request().is_disabled());
    }

    #[test]
    fn test_zero_island_and_incomplete_fixes_dropped() {
        let h = harness();
        h.permissions.grant(10001, PermissionLevel::Fine);

        let (transport, receiver) = channel_transport();
        h.manager
            .register_location_request(
                ClientKey::next(),
                request(1_000),
                identity(),
                PermissionLevel::Fine,
                transport,
            )
            .unwrap();

        h.manager.on_report_location(fix(0.0, 0.0));
        let incomplete = Location::new("gps", 47.6, -122.3);
        h.manager.on_report_location(incomplete);

        assert!(receiver.recv_timeout(Duration::from_millis(200)).is_err());
        assert!(h
            .manager
            .get_last_location(&identity(), PermissionLevel::Fine, false)
            .is_none());
    }

    #[test]
    fn test_dump_mentions_registrations() {
        let h = harness();
        h.permissions.grant(10001, PermissionLevel::Fine);
        let (transport, _receiver) = channel_transport();
        h.manager
            .register_location_request(
                ClientKey::next(),
                request(1_000),
                identity(),
                PermissionLevel::Fine,
                transport,
            )
            .unwrap();

        let dump = h.manager.dump();
        assert!(dump.contains("gps provider"));
        assert!(dump.contains("com.example.app"));
        assert!(dump.contains("user 0"));
    }
}
