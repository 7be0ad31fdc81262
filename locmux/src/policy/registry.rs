//! Provider identity registry.
//!
//! Some privileges (settings bypass, throttle exemption) extend to callers
//! that are themselves location providers.

use crate::identity::CallerIdentity;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

pub trait ProviderRegistry: Send + Sync {
    fn is_provider(&self, identity: &CallerIdentity) -> bool;
}

/// Registry backed by a set of provider uids.
#[derive(Default)]
pub struct StaticProviderRegistry {
    uids: Mutex<HashSet<u32>>,
}

impl StaticProviderRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_provider_uid(&self, uid: u32) {
        self.uids.lock().unwrap().insert(uid);
    }

    pub fn remove_provider_uid(&self, uid: u32) {
        self.uids.lock().unwrap().remove(&uid);
    }
}

impl ProviderRegistry for StaticProviderRegistry {
    fn is_provider(&self, identity: &CallerIdentity) -> bool {
        self.uids.lock().unwrap().contains(&identity.uid)
    }
}
