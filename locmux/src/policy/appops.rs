//! App-op noting at delivery time.

use super::PermissionLevel;
use crate::identity::CallerIdentity;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Notes an app op for each location handed to a client. A `false` return
/// silently drops that delivery only.
pub trait AppOpsHelper: Send + Sync {
    fn note_op(&self, level: PermissionLevel, identity: &CallerIdentity) -> bool;
}

/// Allows every op.
#[derive(Default)]
pub struct PermissiveAppOps;

impl AppOpsHelper for PermissiveAppOps {
    fn note_op(&self, _level: PermissionLevel, _identity: &CallerIdentity) -> bool {
        true
    }
}

/// Counts noted ops and can be flipped to denying.
#[derive(Default)]
pub struct RecordingAppOps {
    deny: AtomicBool,
    noted: AtomicU64,
}

impl RecordingAppOps {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_deny(&self, deny: bool) {
        self.deny.store(deny, Ordering::SeqCst);
    }

    pub fn noted_count(&self) -> u64 {
        self.noted.load(Ordering::SeqCst)
    }
}

impl AppOpsHelper for RecordingAppOps {
    fn note_op(&self, _level: PermissionLevel, _identity: &CallerIdentity) -> bool {
        self.noted.fetch_add(1, Ordering::SeqCst);
        !self.deny.load(Ordering::SeqCst)
    }
}
