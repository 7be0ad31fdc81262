//! Caller identity and user scoping.

use std::fmt;

/// Identifier of a device user (profile). Always non-negative.
pub type UserId = u32;

/// Either a single user or every running user.
///
/// Operations that the original service expressed with sentinel user ids
/// take an explicit scope instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserScope {
    /// Apply to all running users.
    All,
    /// Apply to one user.
    Single(UserId),
}

impl From<UserId> for UserScope {
    fn from(user_id: UserId) -> Self {
        UserScope::Single(user_id)
    }
}

/// Opaque key identifying one client subscription within a provider
/// manager. Registering again under the same key replaces the previous
/// subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientKey(u64);

impl ClientKey {
    /// Allocate a fresh key.
    pub fn next() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ClientKey(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client#{}", self.0)
    }
}

/// Immutable identity of a calling client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallerIdentity {
    /// User the caller runs as.
    pub user_id: UserId,
    /// Kernel uid of the caller.
    pub uid: u32,
    /// Process id of the caller.
    pub pid: u32,
    /// Package name of the caller.
    pub package: String,
    /// Optional attribution tag within the package.
    pub attribution_tag: Option<String>,
    /// Whether the caller is a system component (exempt from the
    /// current-user gate).
    pub system: bool,
}

impl CallerIdentity {
    pub fn new(user_id: UserId, uid: u32, pid: u32, package: impl Into<String>) -> Self {
        Self {
            user_id,
            uid,
            pid,
            package: package.into(),
            attribution_tag: None,
            system: false,
        }
    }

    pub fn with_attribution_tag(mut self, tag: impl Into<String>) -> Self {
        self.attribution_tag = Some(tag.into());
        self
    }

    pub fn with_system(mut self, system: bool) -> Self {
        self.system = system;
        self
    }
}

impl fmt::Display for CallerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}[u{}]", self.package, self.uid, self.user_id)?;
        if let Some(tag) = &self.attribution_tag {
            write!(f, "({})", tag)?;
        }
        Ok(())
    }
}
