//! End-to-end scenarios for the provider manager: request merging, policy
//! reactions, delivery gating, and cache behavior, driven through the
//! public API with the in-memory policy stack.

use locmux::alarm::TimerAlarms;
use locmux::identity::{CallerIdentity, ClientKey};
use locmux::location::Location;
use locmux::manager::{LocationProviderManager, ProviderEnabledListener};
use locmux::policy::{
    InMemoryForeground, InMemoryPermissions, InMemoryPowerSave, InMemoryScreen, InMemorySettings,
    InMemoryUsers, PermissionLevel, PowerSaveMode, RecordingBroadcaster,
};
use locmux::provider::{MockProvider, PowerRequirement, ProviderProperties};
use locmux::request::{LocationRequest, Quality, WorkSource};
use locmux::time;
use locmux::transport::{channel_transport, ClientEvent};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::{Duration, Instant};

const UID: u32 = 10001;
const PACKAGE: &str = "com.example.maps";

struct Harness {
    manager: Arc<LocationProviderManager>,
    provider: Arc<MockProvider>,
    settings: Arc<InMemorySettings>,
    users: Arc<InMemoryUsers>,
    permissions: Arc<InMemoryPermissions>,
    foreground: Arc<InMemoryForeground>,
    power_save: Arc<InMemoryPowerSave>,
    screen: Arc<InMemoryScreen>,
    alarms: Arc<TimerAlarms>,
    broadcaster: Arc<RecordingBroadcaster>,
}

fn harness() -> Harness {
    harness_named("gps")
}

fn harness_named(name: &str) -> Harness {
    let settings = InMemorySettings::new();
    let users = InMemoryUsers::new(0);
    let permissions = InMemoryPermissions::new();
    let foreground = InMemoryForeground::new();
    let power_save = InMemoryPowerSave::new();
    let screen = InMemoryScreen::new();
    let alarms = TimerAlarms::new();
    let broadcaster = RecordingBroadcaster::new();

    let manager = LocationProviderManager::builder(name)
        .settings(settings.clone())
        .users(users.clone())
        .permissions(permissions.clone())
        .foreground(foreground.clone())
        .power_save(power_save.clone())
        .screen(screen.clone())
        .alarms(alarms.clone())
        .broadcaster(broadcaster.clone())
        .fudger_seed(42)
        .build();

    let provider = MockProvider::new(ProviderProperties {
        power_requirement: PowerRequirement::High,
    });
    manager.set_real_provider(Some(provider.clone()));
    manager.start_manager();

    Harness {
        manager,
        provider,
        settings,
        users,
        permissions,
        foreground,
        power_save,
        screen,
        alarms,
        broadcaster,
    }
}

fn identity() -> CallerIdentity {
    CallerIdentity::new(0, UID, 4242, PACKAGE)
}

fn request(interval_ms: u64) -> LocationRequest {
    LocationRequest::new(interval_ms).with_work_source(WorkSource::single(UID, PACKAGE))
}

fn fix_at(elapsed_ms: u64) -> Location {
    Location::new("gps", 47.6062, -122.3321)
        .with_accuracy(10.0)
        .with_elapsed_realtime_millis(elapsed_ms)
}

fn recv_location(receiver: &Receiver<ClientEvent>) -> Option<Location> {
    match receiver.recv_timeout(Duration::from_secs(2)) {
        Ok(ClientEvent::Location {
            location,
            on_complete,
        }) => {
            if let Some(on_complete) = on_complete {
                on_complete.invoke();
            }
            location
        }
        Ok(other) => panic!("unexpected event: {:?}", other),
        Err(_) => panic!("no delivery within timeout"),
    }
}

fn expect_quiet(receiver: &Receiver<ClientEvent>) {
    if let Ok(event) = receiver.recv_timeout(Duration::from_millis(300)) {
        panic!("unexpected event: {:?}", event);
    }
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("condition not reached within timeout");
}

// ---------------------------------------------------------------------
// background throttle
// ---------------------------------------------------------------------

#[test]
fn test_background_throttle_reshapes_provider_request() {
    let h = harness();
    h.permissions.grant(UID, PermissionLevel::Fine);
    h.settings.set_background_throttle_interval_ms(30_000);

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
    assert_eq!(h.manager.current_request().interval_ms, 1_000);

    let t0 = time::elapsed_realtime_millis();
    h.manager.on_report_location(fix_at(t0));
    assert!(recv_location(&receiver).is_some());

    h.foreground.set_foreground(UID, false);
    assert_eq!(h.manager.current_request().interval_ms, 30_000);
    assert_eq!(h.provider.last_request().unwrap().interval_ms, 30_000);

    // one second later: inside the throttled floor, rejected
    h.manager.on_report_location(fix_at(t0 + 1_000));
    expect_quiet(&receiver);

    // past the floor minus the 3s jitter budget: delivered
    h.manager.on_report_location(fix_at(t0 + 31_000));
    assert!(recv_location(&receiver).is_some());
}

// ---------------------------------------------------------------------
// coarse coercion
// ---------------------------------------------------------------------

#[test]
fn test_coarse_client_is_coerced_and_fudged() {
    let h = harness();
    h.permissions.grant(UID, PermissionLevel::Coarse);

    let (transport, receiver) = channel_transport();
    h.manager
        .register_location_request(
            ClientKey::next(),
            request(5_000).with_min_update_interval(0),
            identity(),
            PermissionLevel::Coarse,
            transport,
        )
        .unwrap();

    // interval and floor snap to the 10 minute coarse grid
    let merged = h.manager.current_request();
    assert_eq!(merged.interval_ms, 600_000);
    assert_eq!(merged.quality, Quality::LowPower);

    let t0 = time::elapsed_realtime_millis();
    h.manager.on_report_location(fix_at(t0));
    let delivered = recv_location(&receiver).expect("coarse delivery");
    assert!(delivered.accuracy_m.unwrap() >= 2_000.0);
    assert!(delivered.altitude_m.is_none());

    // a minute later: far below the coarse floor, rejected
    h.manager.on_report_location(fix_at(t0 + 60_000));
    expect_quiet(&receiver);
}

// ---------------------------------------------------------------------
// delayed re-registration
// ---------------------------------------------------------------------

#[test]
fn test_delayed_reregistration_holds_back_faster_request() {
    let h = harness();
    h.permissions.grant(UID, PermissionLevel::Fine);

    let (transport_a, receiver_a) = channel_transport();
    h.manager
        .register_location_request(
            ClientKey::next(),
            request(60_000),
            identity(),
            PermissionLevel::Fine,
            transport_a,
        )
        .unwrap();

    // A has just received a fix (stamped slightly ahead so its age stays
    // zero while the test runs)
    h.manager
        .on_report_location(fix_at(time::elapsed_realtime_millis() + 5_000));
    assert!(recv_location(&receiver_a).is_some());
    assert_eq!(h.provider.last_request().unwrap().interval_ms, 60_000);
    assert_eq!(h.alarms.pending_count(), 0);

    // B wants 30s; both A and the cache say nothing is due for 30s, so the
    // new request is held back by the delayed-register alarm
    let key_b = ClientKey::next();
    let (transport_b, _receiver_b) = channel_transport();
    h.manager
        .register_location_request(key_b, request(30_000), identity(), PermissionLevel::Fine, transport_b)
        .unwrap();

    assert_eq!(h.provider.last_request().unwrap().interval_ms, 60_000);
    assert_eq!(h.alarms.pending_count(), 1);

    // removing B supersedes the pending apply; the slower request goes out
    // immediately and the alarm is cancelled
    h.manager.unregister_location_request(key_b);
    assert_eq!(h.provider.last_request().unwrap().interval_ms, 60_000);
    assert_eq!(h.alarms.pending_count(), 0);
}

#[test]
fn test_faster_request_applies_immediately_when_nothing_served() {
    let h = harness();
    h.permissions.grant(UID, PermissionLevel::Fine);

    let (transport, _receiver) = channel_transport();
    h.manager
        .register_location_request(
            ClientKey::next(),
            request(30_000),
            identity(),
            PermissionLevel::Fine,
            transport,
        )
        .unwrap();

    // no last delivered location and an empty cache mean zero delay
    assert_eq!(h.provider.last_request().unwrap().interval_ms, 30_000);
    assert_eq!(h.alarms.pending_count(), 0);
}

// ---------------------------------------------------------------------
// one-shot requests
// ---------------------------------------------------------------------

#[test]
fn test_one_shot_satisfied_from_cache() {
    let h = harness();
    h.permissions.grant(UID, PermissionLevel::Fine);

    // seed the cache with a 4 second old fix
    h.manager
        .on_report_location(fix_at(time::elapsed_realtime_millis() - 4_000));
    let requests_before = h.provider.requests().len();

    let (transport, receiver) = channel_transport();
    h.manager
        .get_current_location(request(0), identity(), PermissionLevel::Fine, transport)
        .unwrap();

    let delivered = recv_location(&receiver).expect("cached delivery");
    assert_eq!(delivered.latitude, 47.6062);
    // satisfied without waking the provider
    assert_eq!(h.provider.requests().len(), requests_before);
    assert!(h.manager.current_request().is_disabled());
}

#[test]
fn test_one_shot_times_out_with_null() {
    let h = harness();
    h.permissions.grant(UID, PermissionLevel::Fine);

    let (transport, receiver) = channel_transport();
    h.manager
        .get_current_location(
            request(0).with_duration(200),
            identity(),
            PermissionLevel::Fine,
            transport,
        )
        .unwrap();

    // no cache: the provider is asked to produce a location
    assert!(!h.manager.current_request().is_disabled());

    // the expiration alarm delivers the give-up null and removes
    assert!(recv_location(&receiver).is_none());
    wait_until(|| h.manager.current_request().is_disabled());
}

#[test]
fn test_one_shot_never_active_fails_fast() {
    let h = harness();
    // no permission granted

    let (transport, receiver) = channel_transport();
    h.manager
        .get_current_location(request(0), identity(), PermissionLevel::Fine, transport)
        .unwrap();

    assert!(recv_location(&receiver).is_none());
    assert!(h.manager.current_request().is_disabled());
}

#[test]
fn test_one_shot_cancellation_is_idempotent() {
    let h = harness();
    h.permissions.grant(UID, PermissionLevel::Fine);

    let (transport, receiver) = channel_transport();
    let handle = h
        .manager
        .get_current_location(
            request(0).with_duration(10_000),
            identity(),
            PermissionLevel::Fine,
            transport,
        )
        .unwrap();

    assert!(!h.manager.current_request().is_disabled());
    handle.cancel();
    handle.cancel();
    assert!(h.manager.current_request().is_disabled());
    expect_quiet(&receiver);
}

#[test]
fn test_one_shot_bypass_keeps_waiting_when_inactive() {
    let h = harness();
    h.permissions.grant(UID, PermissionLevel::Fine);
    h.settings.set_ignore_settings_allowed(PACKAGE, true);

    let (transport, receiver) = channel_transport();
    h.manager
        .get_current_location(
            request(0).with_location_settings_ignored(true),
            identity(),
            PermissionLevel::Fine,
            transport,
        )
        .unwrap();
    assert!(!h.manager.current_request().is_disabled());

    // revoking the permission deactivates the bypass one-shot, but it does
    // not fail fast: it keeps waiting for a possible re-grant
    h.permissions.revoke(UID);
    expect_quiet(&receiver);
    assert!(h.manager.dump().contains(PACKAGE));
}

// ---------------------------------------------------------------------
// client death
// ---------------------------------------------------------------------

#[test]
fn test_client_death_removes_registration() {
    let h = harness();
    h.permissions.grant(UID, PermissionLevel::Fine);

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

    let t0 = time::elapsed_realtime_millis();
    h.manager.on_report_location(fix_at(t0));
    assert!(recv_location(&receiver).is_some());

    // the client dies
    drop(receiver);
    h.manager.on_report_location(fix_at(t0 + 2_000));

    wait_until(|| h.manager.current_request().is_disabled());
    assert!(h.provider.last_request().unwrap().is_disabled());
    // the delayed-register alarm (if any) and wakelock timeouts are gone
    wait_until(|| h.alarms.pending_count() == 0);
}

// ---------------------------------------------------------------------
// power save and screen state
// ---------------------------------------------------------------------

#[test]
fn test_screen_off_disables_and_screen_on_restores() {
    let h = harness();
    h.permissions.grant(UID, PermissionLevel::Fine);
    h.power_save.set_mode(PowerSaveMode::AllDisabledWhenScreenOff);

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
    h.manager
        .on_report_location(fix_at(time::elapsed_realtime_millis()));
    assert!(recv_location(&receiver).is_some());

    h.screen.set_interactive(false);
    assert!(h.manager.current_request().is_disabled());

    // power-save inactivity does not clear the cache
    assert!(h
        .manager
        .get_last_location(&identity(), PermissionLevel::Fine, false)
        .is_some());

    h.screen.set_interactive(true);
    assert!(!h.manager.current_request().is_disabled());
    assert_eq!(h.manager.current_request().interval_ms, 1_000);
}

#[test]
fn test_foreground_only_mode_gates_background_clients() {
    let h = harness();
    h.permissions.grant(UID, PermissionLevel::Fine);
    h.power_save.set_mode(PowerSaveMode::ForegroundOnly);

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
    assert!(!h.manager.current_request().is_disabled());

    h.foreground.set_foreground(UID, false);
    assert!(h.manager.current_request().is_disabled());

    h.foreground.set_foreground(UID, true);
    assert!(!h.manager.current_request().is_disabled());
}

#[test]
fn test_gps_screen_off_mode_ignores_other_providers() {
    let h = harness_named("network");
    h.permissions.grant(UID, PermissionLevel::Fine);
    h.power_save
        .set_mode(PowerSaveMode::GpsDisabledWhenScreenOff);

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

    h.screen.set_interactive(false);
    // only the gps provider is constrained by this mode
    assert!(!h.manager.current_request().is_disabled());
}

// ---------------------------------------------------------------------
// enabled state machine
// ---------------------------------------------------------------------

#[test]
fn test_location_setting_off_notifies_and_clears_cache() {
    let h = harness();
    h.permissions.grant(UID, PermissionLevel::Fine);

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
    h.manager
        .on_report_location(fix_at(time::elapsed_realtime_millis()));
    assert!(recv_location(&receiver).is_some());

    h.settings.set_location_enabled(0, false);
    assert!(h.manager.current_request().is_disabled());
    assert!(!h.manager.is_enabled(0));

    // the client hears about the disable through its transport
    match receiver.recv_timeout(Duration::from_secs(2)).unwrap() {
        ClientEvent::ProviderEnabled { provider, enabled } => {
            assert_eq!(provider, "gps");
            assert!(!enabled);
        }
        other => panic!("unexpected event: {:?}", other),
    }

    // normal slots are cleared, bypass slots survive
    assert!(h
        .manager
        .get_last_location(&identity(), PermissionLevel::Fine, false)
        .is_none());
    assert!(h
        .manager
        .get_last_location(&identity(), PermissionLevel::Fine, true)
        .is_some());

    wait_until(|| h.broadcaster.sent().contains(&(0, "gps".to_string(), false)));
}

#[test]
fn test_fused_provider_never_broadcasts() {
    let h = harness_named("fused");
    h.settings.set_location_enabled(0, false);
    wait_until(|| !h.manager.is_enabled(0));
    std::thread::sleep(Duration::from_millis(100));
    assert!(h.broadcaster.sent().is_empty());
}

#[test]
fn test_registration_while_disabled_gets_immediate_notice() {
    let h = harness();
    h.permissions.grant(UID, PermissionLevel::Fine);
    h.settings.set_location_enabled(0, false);

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

    match receiver.recv_timeout(Duration::from_secs(2)).unwrap() {
        ClientEvent::ProviderEnabled { enabled, .. } => assert!(!enabled),
        other => panic!("unexpected event: {:?}", other),
    }
    assert!(h.manager.current_request().is_disabled());
}

#[test]
fn test_enabled_listener_api() {
    struct Probe(std::sync::Mutex<Vec<(String, u32, bool)>>);
    impl ProviderEnabledListener for Probe {
        fn on_provider_enabled_changed(&self, provider: &str, user_id: u32, enabled: bool) {
            self.0
                .lock()
                .unwrap()
                .push((provider.to_string(), user_id, enabled));
        }
    }

    let h = harness();
    let probe = Arc::new(Probe(std::sync::Mutex::new(Vec::new())));
    let id = h.manager.add_enabled_listener(probe.clone());

    h.settings.set_location_enabled(0, false);
    wait_until(|| !probe.0.lock().unwrap().is_empty());
    assert_eq!(
        probe.0.lock().unwrap()[0],
        ("gps".to_string(), 0, false)
    );

    h.manager.remove_enabled_listener(id);
    h.settings.set_location_enabled(0, true);
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(probe.0.lock().unwrap().len(), 1);
}

// ---------------------------------------------------------------------
// user lifecycle
// ---------------------------------------------------------------------

#[test]
fn test_user_switch_gates_non_current_users() {
    let h = harness();
    h.permissions.grant(UID, PermissionLevel::Fine);

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
    assert!(!h.manager.current_request().is_disabled());

    h.users.switch_user(10);
    assert!(h.manager.current_request().is_disabled());

    h.users.switch_user(0);
    assert!(!h.manager.current_request().is_disabled());
}

#[test]
fn test_system_clients_ignore_current_user() {
    let h = harness();
    h.permissions.grant(UID, PermissionLevel::Fine);

    let (transport, _receiver) = channel_transport();
    h.manager
        .register_location_request(
            ClientKey::next(),
            request(1_000),
            identity().with_system(true),
            PermissionLevel::Fine,
            transport,
        )
        .unwrap();

    h.users.switch_user(10);
    assert!(!h.manager.current_request().is_disabled());
}

#[test]
fn test_user_stop_drops_cache() {
    let h = harness();
    h.permissions.grant(UID, PermissionLevel::Fine);
    h.manager
        .on_report_location(fix_at(time::elapsed_realtime_millis()));
    assert!(h
        .manager
        .get_last_location(&identity(), PermissionLevel::Fine, false)
        .is_some());

    h.users.stop_user(0);
    assert!(h
        .manager
        .get_last_location(&identity(), PermissionLevel::Fine, true)
        .is_none());
}

// ---------------------------------------------------------------------
// merging
// ---------------------------------------------------------------------

#[test]
fn test_merge_picks_min_interval_best_quality_and_blames_fast_clients() {
    let h = harness();
    h.permissions.grant(UID, PermissionLevel::Fine);
    let other_uid = 10002;
    h.permissions.grant(other_uid, PermissionLevel::Fine);

    // slow, low power client first
    let (transport_b, _receiver_b) = channel_transport();
    h.manager
        .register_location_request(
            ClientKey::next(),
            LocationRequest::new(5_000)
                .with_quality(Quality::LowPower)
                .with_low_power(true)
                .with_work_source(WorkSource::single(other_uid, "com.example.widget")),
            CallerIdentity::new(0, other_uid, 777, "com.example.widget"),
            PermissionLevel::Fine,
            transport_b,
        )
        .unwrap();

    // passive observer contributes nothing
    let (transport_c, _receiver_c) = channel_transport();
    h.manager
        .register_location_request(
            ClientKey::next(),
            LocationRequest::passive().with_work_source(WorkSource::single(UID, PACKAGE)),
            identity(),
            PermissionLevel::Fine,
            transport_c,
        )
        .unwrap();

    // fast, high accuracy client
    let (transport_a, _receiver_a) = channel_transport();
    h.manager
        .register_location_request(
            ClientKey::next(),
            request(1_000).with_quality(Quality::HighAccuracy),
            identity(),
            PermissionLevel::Fine,
            transport_a,
        )
        .unwrap();

    let merged = h.manager.current_request();
    assert_eq!(merged.interval_ms, 1_000);
    assert_eq!(merged.quality, Quality::HighAccuracy);
    assert!(!merged.low_power);

    // power blame threshold is ((1000 + 1000) / 2) * 3 = 3000, so only the
    // fast client is blamed
    let blamed: Vec<_> = merged.work_source.iter().cloned().collect();
    assert_eq!(blamed, vec![(UID, PACKAGE.to_string())]);
}

#[test]
fn test_passive_only_keeps_provider_stopped_but_observes() {
    let h = harness();
    h.permissions.grant(UID, PermissionLevel::Fine);

    let (transport, receiver) = channel_transport();
    h.manager
        .register_location_request(
            ClientKey::next(),
            LocationRequest::passive().with_work_source(WorkSource::single(UID, PACKAGE)),
            identity(),
            PermissionLevel::Fine,
            transport,
        )
        .unwrap();

    assert!(h.manager.current_request().is_disabled());

    // a fix produced for someone else still reaches the passive observer
    h.manager
        .on_report_location(fix_at(time::elapsed_realtime_millis()));
    assert!(recv_location(&receiver).is_some());
}

// ---------------------------------------------------------------------
// delivery discipline
// ---------------------------------------------------------------------

#[test]
fn test_max_updates_terminates_registration() {
    let h = harness();
    h.permissions.grant(UID, PermissionLevel::Fine);

    let (transport, receiver) = channel_transport();
    h.manager
        .register_location_request(
            ClientKey::next(),
            request(1_000).with_min_update_interval(0).with_max_updates(2),
            identity(),
            PermissionLevel::Fine,
            transport,
        )
        .unwrap();

    let t0 = time::elapsed_realtime_millis();
    h.manager.on_report_location(fix_at(t0));
    assert!(recv_location(&receiver).is_some());
    h.manager.on_report_location(fix_at(t0 + 1_000));
    assert!(recv_location(&receiver).is_some());

    // the second delivery hit max updates
    wait_until(|| h.manager.current_request().is_disabled());
    h.manager.on_report_location(fix_at(t0 + 2_000));
    expect_quiet(&receiver);
}

#[test]
fn test_jitter_budget_on_min_update_interval() {
    let h = harness();
    h.permissions.grant(UID, PermissionLevel::Fine);

    let (transport, receiver) = channel_transport();
    h.manager
        .register_location_request(
            ClientKey::next(),
            request(10_000),
            identity(),
            PermissionLevel::Fine,
            transport,
        )
        .unwrap();

    let t0 = time::elapsed_realtime_millis();
    h.manager.on_report_location(fix_at(t0));
    assert!(recv_location(&receiver).is_some());

    // jitter budget is min(10% of 10s, 5s) = 1s, so 9.2s is acceptable
    h.manager.on_report_location(fix_at(t0 + 9_200));
    assert!(recv_location(&receiver).is_some());

    // 8.9s is under the floor
    h.manager.on_report_location(fix_at(t0 + 9_200 + 8_900));
    expect_quiet(&receiver);
}

#[test]
fn test_min_update_distance_filters_stationary_fixes() {
    let h = harness();
    h.permissions.grant(UID, PermissionLevel::Fine);

    let (transport, receiver) = channel_transport();
    h.manager
        .register_location_request(
            ClientKey::next(),
            request(1_000)
                .with_min_update_interval(0)
                .with_min_update_distance(100.0),
            identity(),
            PermissionLevel::Fine,
            transport,
        )
        .unwrap();

    let t0 = time::elapsed_realtime_millis();
    h.manager.on_report_location(fix_at(t0));
    assert!(recv_location(&receiver).is_some());

    // a few meters of drift is filtered
    let near = Location::new("gps", 47.60621, -122.3321)
        .with_accuracy(10.0)
        .with_elapsed_realtime_millis(t0 + 1_000);
    h.manager.on_report_location(near);
    expect_quiet(&receiver);

    // a real move passes
    let far = Location::new("gps", 47.6080, -122.3321)
        .with_accuracy(10.0)
        .with_elapsed_realtime_millis(t0 + 2_000);
    h.manager.on_report_location(far);
    assert!(recv_location(&receiver).is_some());
}

#[test]
fn test_non_mock_delivery_carries_completion_mock_does_not() {
    let h = harness();
    h.permissions.grant(UID, PermissionLevel::Fine);

    let (transport, receiver) = channel_transport();
    h.manager
        .register_location_request(
            ClientKey::next(),
            request(1_000).with_min_update_interval(0),
            identity(),
            PermissionLevel::Fine,
            transport,
        )
        .unwrap();

    let t0 = time::elapsed_realtime_millis();
    h.manager.on_report_location(fix_at(t0));
    match receiver.recv_timeout(Duration::from_secs(2)).unwrap() {
        ClientEvent::Location { on_complete, .. } => {
            let on_complete = on_complete.expect("wakelock completion for real fix");
            on_complete.invoke();
            on_complete.invoke();
            assert!(on_complete.is_spent());
        }
        other => panic!("unexpected event: {:?}", other),
    }

    h.manager.on_report_location(fix_at(t0 + 1_000).with_mock(true));
    match receiver.recv_timeout(Duration::from_secs(2)).unwrap() {
        ClientEvent::Location { on_complete, .. } => assert!(on_complete.is_none()),
        other => panic!("unexpected event: {:?}", other),
    }
}

// ---------------------------------------------------------------------
// historical delivery and cache seeding
// ---------------------------------------------------------------------

#[test]
fn test_historical_delivery_on_activation() {
    let h = harness();
    h.permissions.grant(UID, PermissionLevel::Fine);

    // a 10 second old fix seeded into an empty cache
    let seeded = fix_at(time::elapsed_realtime_millis() - 10_000);
    h.manager.inject_last_location(seeded, 0);

    let (transport, receiver) = channel_transport();
    h.manager
        .register_location_request(
            ClientKey::next(),
            request(120_000).with_deliver_historical(true),
            identity(),
            PermissionLevel::Fine,
            transport,
        )
        .unwrap();

    // delivered synchronously from the cache, before any provider fix
    assert!(recv_location(&receiver).is_some());
}

#[test]
fn test_inject_only_seeds_an_empty_cache() {
    let h = harness();
    h.permissions.grant(UID, PermissionLevel::Fine);

    let now = time::elapsed_realtime_millis();
    h.manager.inject_last_location(fix_at(now - 5_000), 0);
    let first = h
        .manager
        .get_last_location(&identity(), PermissionLevel::Fine, false)
        .unwrap();

    let other = Location::new("gps", 10.0, 20.0)
        .with_accuracy(5.0)
        .with_elapsed_realtime_millis(now);
    h.manager.inject_last_location(other, 0);
    let second = h
        .manager
        .get_last_location(&identity(), PermissionLevel::Fine, false)
        .unwrap();

    assert_eq!(first.latitude, second.latitude);
}

// ---------------------------------------------------------------------
// mock provider sessions
// ---------------------------------------------------------------------

#[test]
fn test_mock_session_and_teardown_clears_mock_state() {
    let h = harness();
    h.permissions.grant(UID, PermissionLevel::Fine);

    let mock = MockProvider::new(ProviderProperties::default());
    h.manager.set_mock_provider(Some(mock));
    assert!(h.manager.is_mock());

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

    h.manager
        .set_mock_provider_location(fix_at(time::elapsed_realtime_millis()))
        .unwrap();
    let delivered = recv_location(&receiver).expect("mock delivery");
    assert!(delivered.from_mock);

    assert!(h
        .manager
        .get_last_location(&identity(), PermissionLevel::Fine, false)
        .is_some());

    // ending the mock session forgets everything the mock produced
    h.manager.set_mock_provider(None);
    assert!(!h.manager.is_mock());
    assert!(h
        .manager
        .get_last_location(&identity(), PermissionLevel::Fine, false)
        .is_none());
}

#[test]
fn test_mock_allowed_toggle_flips_enabled() {
    let h = harness();
    let mock = MockProvider::new(ProviderProperties::default());
    h.manager.set_mock_provider(Some(mock));

    assert!(h.manager.is_enabled(0));
    h.manager.set_mock_provider_allowed(false).unwrap();
    assert!(!h.manager.is_enabled(0));
    h.manager.set_mock_provider_allowed(true).unwrap();
    assert!(h.manager.is_enabled(0));
}

// ---------------------------------------------------------------------
// shutdown
// ---------------------------------------------------------------------

#[test]
fn test_stop_manager_clears_everything() {
    let h = harness();
    h.permissions.grant(UID, PermissionLevel::Fine);

    for _ in 0..3 {
        let (transport, receiver) = channel_transport();
        std::mem::forget(receiver);
        h.manager
            .register_location_request(
                ClientKey::next(),
                request(1_000),
                identity(),
                PermissionLevel::Fine,
                transport,
            )
            .unwrap();
    }
    assert!(!h.manager.current_request().is_disabled());

    h.manager.stop_manager();
    assert!(h.manager.current_request().is_disabled());
    assert!(!h.manager.dump().contains("registrations:"));

    // a stopped manager rejects new work but can be restarted
    let (transport, _receiver) = channel_transport();
    assert!(h
        .manager
        .register_location_request(
            ClientKey::next(),
            request(1_000),
            identity(),
            PermissionLevel::Fine,
            transport,
        )
        .is_err());

    h.manager.start_manager();
    let (transport, _receiver) = channel_transport();
    assert!(h
        .manager
        .register_location_request(
            ClientKey::next(),
            request(1_000),
            identity(),
            PermissionLevel::Fine,
            transport,
        )
        .is_ok());
}
