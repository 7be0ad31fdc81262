//! locmux - per-provider location request multiplexing
//!
//! This library implements the core of a location service: a
//! [`manager::LocationProviderManager`] fronts one named provider (gps,
//! fused, ...), accepts many concurrent client subscriptions, merges them
//! into a single provider-level request, and fans incoming fixes back out
//! to the eligible subset of clients while reacting to user, permission,
//! settings, power-save, and screen changes.
//!
//! # High-Level API
//!
//! ```ignore
//! use locmux::manager::LocationProviderManager;
//! use locmux::policy::PermissionLevel;
//! use locmux::request::LocationRequest;
//! use locmux::transport::channel_transport;
//!
//! let manager = LocationProviderManager::builder("gps").build();
//! manager.start_manager();
//!
//! let (transport, events) = channel_transport();
//! manager.register_location_request(
//!     locmux::identity::ClientKey::next(),
//!     LocationRequest::new(1_000),
//!     identity,
//!     PermissionLevel::Fine,
//!     transport,
//! )?;
//! ```

pub mod alarm;
pub mod config;
pub mod events;
pub mod executor;
pub mod fudger;
pub mod geo;
pub mod identity;
pub mod last_location;
pub mod location;
pub mod logging;
pub mod manager;
pub mod policy;
pub mod provider;
mod registration;
pub mod request;
pub mod time;
pub mod transport;
pub mod wakelock;

/// Version of the locmux library and CLI.
///
/// This is synchronized across all components in the workspace and
/// injected at compile time from `Cargo.toml`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
