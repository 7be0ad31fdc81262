//! Location permission checks.

use super::{ListenerId, Listeners};
use crate::identity::CallerIdentity;
use dashmap::DashMap;
use std::sync::Arc;

/// Granted location permission level. `Fine` implies `Coarse`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PermissionLevel {
    Coarse,
    Fine,
}

pub trait PermissionsListener: Send + Sync {
    fn on_permissions_changed_for_package(&self, package: &str);
    fn on_permissions_changed_for_uid(&self, uid: u32);
}

/// Permission lookups plus revocation/grant subscription.
pub trait PermissionsHelper: Send + Sync {
    fn has_location_permissions(&self, level: PermissionLevel, identity: &CallerIdentity) -> bool;

    fn add_listener(&self, listener: Arc<dyn PermissionsListener>) -> ListenerId;

    fn remove_listener(&self, id: ListenerId);
}

/// In-memory grant table keyed by uid. Unknown uids have no permissions.
#[derive(Default)]
pub struct InMemoryPermissions {
    grants: DashMap<u32, PermissionLevel>,
    listeners: Listeners<dyn PermissionsListener>,
}

impl InMemoryPermissions {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn grant(&self, uid: u32, level: PermissionLevel) {
        self.grants.insert(uid, level);
        for listener in self.listeners.snapshot() {
            listener.on_permissions_changed_for_uid(uid);
        }
    }

    pub fn revoke(&self, uid: u32) {
        self.grants.remove(&uid);
        for listener in self.listeners.snapshot() {
            listener.on_permissions_changed_for_uid(uid);
        }
    }

    /// Signal a package-wide permission change without altering the table,
    /// forcing re-evaluation of cached permission state.
    pub fn touch_package(&self, package: &str) {
        for listener in self.listeners.snapshot() {
            listener.on_permissions_changed_for_package(package);
        }
    }
}

impl PermissionsHelper for InMemoryPermissions {
    fn has_location_permissions(&self, level: PermissionLevel, identity: &CallerIdentity) -> bool {
        self.grants
            .get(&identity.uid)
            .map(|granted| *granted >= level)
            .unwrap_or(false)
    }

    fn add_listener(&self, listener: Arc<dyn PermissionsListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    fn remove_listener(&self, id: ListenerId) {
        self.listeners.remove(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(uid: u32) -> CallerIdentity {
        CallerIdentity::new(0, uid, 99, "com.example.app")
    }

    #[test]
    fn test_unknown_uid_has_nothing() {
        let permissions = InMemoryPermissions::new();
        assert!(!permissions.has_location_permissions(PermissionLevel::Coarse, &identity(10001)));
    }

    #[test]
    fn test_fine_implies_coarse() {
        let permissions = InMemoryPermissions::new();
        permissions.grant(10001, PermissionLevel::Fine);
        assert!(permissions.has_location_permissions(PermissionLevel::Coarse, &identity(10001)));
        assert!(permissions.has_location_permissions(PermissionLevel::Fine, &identity(10001)));
    }

    #[test]
    fn test_coarse_does_not_imply_fine() {
        let permissions = InMemoryPermissions::new();
        permissions.grant(10001, PermissionLevel::Coarse);
        assert!(permissions.has_location_permissions(PermissionLevel::Coarse, &identity(10001)));
        assert!(!permissions.has_location_permissions(PermissionLevel::Fine, &identity(10001)));
    }

    #[test]
    fn test_revoke_notifies_uid_listeners() {
        let permissions = InMemoryPermissions::new();
        permissions.grant(10001, PermissionLevel::Fine);

        struct UidProbe(std::sync::Mutex<Vec<u32>>);
        impl PermissionsListener for UidProbe {
            fn on_permissions_changed_for_package(&self, _package: &str) {}
            fn on_permissions_changed_for_uid(&self, uid: u32) {
                self.0.lock().unwrap().push(uid);
            }
        }

        let probe = Arc::new(UidProbe(std::sync::Mutex::new(Vec::new())));
        permissions.add_listener(probe.clone());

        permissions.revoke(10001);
        assert!(!permissions.has_location_permissions(PermissionLevel::Coarse, &identity(10001)));
        assert_eq!(*probe.0.lock().unwrap(), vec![10001]);
    }
}
