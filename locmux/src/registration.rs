//! Client registrations.
//!
//! A registration is one client subscription: its identity, original and
//! effective requests, delivery transport, and the eligibility flags the
//! manager caches so policy checks stay cheap. Continuous and one-shot
//! subscriptions share this struct; the differences live in
//! [`RegistrationKind`]. All mutable state here is guarded by the
//! manager's lock.

use crate::alarm::AlarmToken;
use crate::identity::{CallerIdentity, ClientKey};
use crate::location::Location;
use crate::policy::{PermissionLevel, ProviderRegistry, SettingsHelper};
use crate::request::{LocationRequest, Quality, MIN_COARSE_INTERVAL_MS};
use crate::transport::{LocationTransport, ProviderTransport};
use crate::wakelock::WakeLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

pub(crate) enum RegistrationKind {
    Continuous {
        provider_transport: Arc<dyn ProviderTransport>,
        wakelock: WakeLock,
        num_delivered: u32,
    },
    OneShot,
}

pub(crate) struct Registration {
    pub key: ClientKey,
    /// Distinguishes this registration from a replacement under the same
    /// key, so a late expiration alarm cannot remove the wrong one.
    pub instance: u64,
    pub identity: CallerIdentity,
    pub permission_level: PermissionLevel,
    /// The request as the client submitted it.
    pub request: LocationRequest,
    /// The request after coarse coercion, bypass clearing, and background
    /// throttling.
    pub effective: LocationRequest,
    pub transport: Arc<dyn LocationTransport>,
    pub permitted: bool,
    pub foreground: bool,
    pub using_high_power: bool,
    pub active: bool,
    pub last_delivered: Option<Location>,
    pub expiration_realtime_ms: u64,
    pub expiration_alarm: Option<AlarmToken>,
    pub kind: RegistrationKind,
}

impl Registration {
    pub fn new_continuous(
        key: ClientKey,
        request: LocationRequest,
        identity: CallerIdentity,
        permission_level: PermissionLevel,
        transport: Arc<dyn LocationTransport>,
        provider_transport: Arc<dyn ProviderTransport>,
        wakelock: WakeLock,
    ) -> Self {
        Self::new(
            key,
            request,
            identity,
            permission_level,
            transport,
            RegistrationKind::Continuous {
                provider_transport,
                wakelock,
                num_delivered: 0,
            },
        )
    }

    pub fn new_one_shot(
        key: ClientKey,
        request: LocationRequest,
        identity: CallerIdentity,
        permission_level: PermissionLevel,
        transport: Arc<dyn LocationTransport>,
    ) -> Self {
        Self::new(
            key,
            request,
            identity,
            permission_level,
            transport,
            RegistrationKind::OneShot,
        )
    }

    fn new(
        key: ClientKey,
        request: LocationRequest,
        identity: CallerIdentity,
        permission_level: PermissionLevel,
        transport: Arc<dyn LocationTransport>,
        kind: RegistrationKind,
    ) -> Self {
        Self {
            key,
            instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
            identity,
            permission_level,
            effective: request.clone(),
            request,
            transport,
            permitted: false,
            foreground: true,
            using_high_power: false,
            active: false,
            last_delivered: None,
            expiration_realtime_ms: u64::MAX,
            expiration_alarm: None,
            kind,
        }
    }

    pub fn is_continuous(&self) -> bool {
        matches!(self.kind, RegistrationKind::Continuous { .. })
    }

    /// Compute the effective request from the original, the cached
    /// foreground flag, and current settings.
    pub fn compute_effective(
        &self,
        settings: &dyn SettingsHelper,
        providers: &dyn ProviderRegistry,
    ) -> LocationRequest {
        let base = &self.request;
        let mut effective = base.clone();

        if self.permission_level < PermissionLevel::Fine {
            effective.quality = Quality::LowPower;
            if base.interval_ms < MIN_COARSE_INTERVAL_MS {
                effective.interval_ms = MIN_COARSE_INTERVAL_MS;
            }
            if base.resolved_min_update_interval_ms() < MIN_COARSE_INTERVAL_MS {
                effective.min_update_interval_ms = MIN_COARSE_INTERVAL_MS;
            }
        }

        let mut settings_ignored = base.location_settings_ignored;
        if settings_ignored
            && !settings.is_ignore_settings_allowed(&self.identity.package)
            && !providers.is_provider(&self.identity)
        {
            // the caller is not currently allowed the bypass
            effective.location_settings_ignored = false;
            settings_ignored = false;
        }

        if !settings_ignored && !self.is_throttling_exempt(settings, providers) && !self.foreground
        {
            effective.interval_ms = effective
                .interval_ms
                .max(settings.background_throttle_interval_ms());
        }

        effective
    }

    fn is_throttling_exempt(
        &self,
        settings: &dyn SettingsHelper,
        providers: &dyn ProviderRegistry,
    ) -> bool {
        settings.is_background_throttle_exempt(&self.identity.package)
            || providers.is_provider(&self.identity)
    }

    /// Human-readable summary for logs and dumps.
    pub fn describe(&self) -> String {
        let mut out = self.identity.to_string();
        if !self.foreground {
            out.push_str(" [bg]");
        }
        if !self.permitted {
            out.push_str(" [na]");
        }
        if self.permission_level == PermissionLevel::Coarse {
            out.push_str(" (COARSE)");
        }
        out.push(' ');
        out.push_str(&self.effective.to_string());
        out
    }
}
