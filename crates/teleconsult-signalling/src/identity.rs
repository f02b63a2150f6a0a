//! The signed-in user

use std::sync::Arc;

use parking_lot::RwLock;

/// Source of the current user's id.
///
/// Consulted at the start of every call operation. `None` means nobody is
/// signed in, or the session has expired.
pub trait IdentityProvider: Send + Sync + 'static {
    fn current_uid(&self) -> Option<String>;
}

/// Identity held in memory, switched explicitly
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity {
    uid: Arc<RwLock<Option<String>>>,
}

impl StaticIdentity {
    pub fn signed_in(uid: impl Into<String>) -> Self {
        Self { uid: Arc::new(RwLock::new(Some(uid.into()))) }
    }

    pub fn signed_out() -> Self {
        Self::default()
    }

    pub fn sign_in(&self, uid: impl Into<String>) {
        *self.uid.write() = Some(uid.into());
    }

    pub fn sign_out(&self) {
        *self.uid.write() = None;
    }
}

impl IdentityProvider for StaticIdentity {
    fn current_uid(&self) -> Option<String> {
        self.uid.read().clone()
    }
}
