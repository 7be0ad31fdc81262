//! Simulated provider session.
//!
//! Wires a [`LocationProviderManager`] to a mock provider and the in-memory
//! policy stack, registers one demo client, and feeds synthetic fixes on an
//! interval until ctrl-c (or a fix count is reached). Deliveries are
//! printed as they arrive, and the manager's diagnostic dump is printed at
//! shutdown.

use crate::error::CliError;
use locmux::config::Config;
use locmux::identity::{CallerIdentity, ClientKey};
use locmux::location::Location;
use locmux::manager::LocationProviderManager;
use locmux::policy::{InMemoryPermissions, InMemorySettings, PermissionLevel};
use locmux::provider::{MockProvider, PowerRequirement, ProviderProperties};
use locmux::request::{LocationRequest, WorkSource};
use locmux::transport::{channel_transport, ClientEvent};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

const DEMO_UID: u32 = 10001;
const DEMO_PACKAGE: &str = "com.example.demo";

pub struct RunOptions {
    pub fix_interval_ms: u64,
    pub request_interval_ms: u64,
    pub count: u64,
    pub coarse: bool,
}

pub async fn run(config: Config, options: RunOptions) -> Result<(), CliError> {
    if options.fix_interval_ms == 0 {
        return Err(CliError::Usage(
            "--fix-interval-ms must be greater than zero".to_string(),
        ));
    }

    let settings = InMemorySettings::new();
    settings.set_coarse_accuracy_m(config.coarse_accuracy_m);
    settings.set_background_throttle_interval_ms(config.background_throttle_interval_ms);

    let permissions = InMemoryPermissions::new();
    let level = if options.coarse {
        PermissionLevel::Coarse
    } else {
        PermissionLevel::Fine
    };
    permissions.grant(DEMO_UID, level);

    let manager = LocationProviderManager::builder(config.provider.clone())
        .settings(settings)
        .permissions(permissions)
        .event_log_capacity(config.event_log_capacity)
        .build();

    let provider = MockProvider::new(ProviderProperties {
        power_requirement: PowerRequirement::High,
    });
    manager.set_real_provider(Some(provider.clone()));
    manager.start_manager();

    let (transport, events) = channel_transport();
    let identity = CallerIdentity::new(0, DEMO_UID, std::process::id(), DEMO_PACKAGE);
    let request = LocationRequest::new(options.request_interval_ms)
        .with_work_source(WorkSource::single(DEMO_UID, DEMO_PACKAGE));
    let key = ClientKey::next();
    manager.register_location_request(key, request, identity, level, transport)?;

    info!(
        provider = %manager.name(),
        request_interval_ms = options.request_interval_ms,
        "demo client registered"
    );

    // print deliveries off the async loop; the iterator ends once the
    // registration (and with it the sending side) is torn down
    let printer = std::thread::spawn(move || {
        for event in events {
            match event {
                ClientEvent::Location {
                    location: Some(location),
                    on_complete,
                } => {
                    println!("fix     {}", location);
                    if let Some(on_complete) = on_complete {
                        on_complete.invoke();
                    }
                }
                ClientEvent::Location { location: None, .. } => println!("fix     <none>"),
                ClientEvent::ProviderEnabled { provider, enabled } => {
                    println!("enabled {} = {}", provider, enabled);
                }
            }
        }
    });

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_cancel.cancel();
        }
    });

    let mut ticker = tokio::time::interval(Duration::from_millis(options.fix_interval_ms));
    let mut sent: u64 = 0;
    // a gentle north-east drift from a fixed starting point
    let mut latitude = 47.6062;
    let mut longitude = -122.3321;

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                info!("shutting down");
                break;
            }

            _ = ticker.tick() => {
                latitude += 0.0001;
                longitude += 0.00005;
                let fix = Location::new(manager.name(), latitude, longitude)
                    .with_accuracy(8.0)
                    .with_speed(11.0)
                    .with_bearing(33.0);
                manager.on_report_location(fix);
                sent += 1;
                if options.count > 0 && sent >= options.count {
                    break;
                }
            }
        }
    }

    manager.unregister_location_request(key);
    manager.stop_manager();

    println!();
    println!("{}", manager.dump());
    println!(
        "generated {} fixes, provider saw {} request updates",
        sent,
        provider.requests().len()
    );

    drop(manager);
    let _ = printer.join();
    Ok(())
}
