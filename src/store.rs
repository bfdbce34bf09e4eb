use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use crate::types::UserId;

/// Well-known key under which the last resolved identity is persisted.
pub const IDENTITY_KEY: &str = "tma_user_id";

/// Persistence key for one identity's cached entitlement status.
#[must_use]
pub fn status_key(identity: &UserId) -> String {
    format!("tma_entitlement:{identity}")
}

/// Consumer-provided client-local persisted store.
///
/// In a browser-hosted Mini-App this is backed by `localStorage`; tests and
/// hostless environments use [`MemoryStore`]. All operations are synchronous
/// and must never block on I/O.
pub trait ClientStore: Send + Sync + 'static {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
}

/// In-memory [`ClientStore`]; contents do not survive the process.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ClientStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_owned(), value.to_owned());
    }

    fn remove(&self, key: &str) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_roundtrip() {
        let store = MemoryStore::new();
        assert!(store.get("k").is_none());
        store.set("k", "v");
        assert_eq!(store.get("k").as_deref(), Some("v"));
        store.remove("k");
        assert!(store.get("k").is_none());
    }

    #[test]
    fn status_key_is_per_identity() {
        let a: UserId = "1".parse().unwrap();
        let b: UserId = "2".parse().unwrap();
        assert_ne!(status_key(&a), status_key(&b));
    }
}
