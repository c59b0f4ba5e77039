//! Ownership registry for live store instances.
//!
//! A logical store identity is a singleton: two managers must never open the
//! same canonical location. The registry is an explicit object shared across
//! managers at composition time, so ownership is scoped to whoever wires the
//! managers together rather than to the whole process.

use crate::{StoreError, StoreResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Opaque identity of a manager instance within one registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnerId(u64);

/// Registry of active store instances keyed by canonical location.
#[derive(Debug, Default)]
pub struct StoreRegistry {
    owners: Mutex<HashMap<String, OwnerId>>,
    next_owner: AtomicU64,
}

impl StoreRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Allocate an identity for a manager joining this registry.
    pub(crate) fn allocate_owner(&self) -> OwnerId {
        OwnerId(self.next_owner.fetch_add(1, Ordering::Relaxed))
    }

    /// Claim a canonical location for `owner`.
    ///
    /// Claiming a location already held by the same owner is a no-op; a
    /// location held by a different owner is refused.
    pub(crate) fn claim(&self, canonical: &str, owner: OwnerId) -> StoreResult<()> {
        let mut owners = self.owners.lock().expect("store registry lock poisoned");
        match owners.get(canonical) {
            Some(current) if *current != owner => Err(StoreError::Configuration(format!(
                "store '{canonical}' is already owned by another storage engine manager"
            ))),
            Some(_) => Ok(()),
            None => {
                owners.insert(canonical.to_string(), owner);
                debug!(store = canonical, "store location claimed");
                Ok(())
            }
        }
    }

    /// Release a canonical location if `owner` holds it.
    pub(crate) fn release(&self, canonical: &str, owner: OwnerId) {
        let mut owners = self.owners.lock().expect("store registry lock poisoned");
        if owners.get(canonical) == Some(&owner) {
            owners.remove(canonical);
            debug!(store = canonical, "store location released");
        }
    }
}
