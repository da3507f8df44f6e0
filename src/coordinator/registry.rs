// Process-wide record of which hosting context owns the live surface.

use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Identifies one hosting context (a tab, a window, a view).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(String);

impl ContextId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ContextId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ContextId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Owner storage. Read-modify-write is racy by construction; callers
/// reconcile through idempotent open/close on the contexts themselves.
pub trait OwnerRegistry: Send + Sync {
    fn get_owner(&self) -> Option<ContextId>;

    fn set_owner(&self, owner: ContextId);

    fn clear_owner(&self);

    /// Clear only while `context` is still the recorded owner.
    fn clear_if_owner(&self, context: &ContextId) -> bool {
        if self.get_owner().as_ref() == Some(context) {
            self.clear_owner();
            true
        } else {
            false
        }
    }
}

/// In-memory registry for a single process.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    owner: RwLock<Option<ContextId>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OwnerRegistry for MemoryRegistry {
    fn get_owner(&self) -> Option<ContextId> {
        self.owner.read().clone()
    }

    fn set_owner(&self, owner: ContextId) {
        debug!("surface owner -> {}", owner);
        *self.owner.write() = Some(owner);
    }

    fn clear_owner(&self) {
        debug!("surface owner cleared");
        *self.owner.write() = None;
    }

    fn clear_if_owner(&self, context: &ContextId) -> bool {
        let mut owner = self.owner.write();
        if owner.as_ref() == Some(context) {
            *owner = None;
            debug!("surface owner {} cleared", context);
            true
        } else {
            false
        }
    }
}
