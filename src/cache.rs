use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::store::{self, ClientStore};
use crate::types::{CacheEntry, UserId};

/// Per-identity last-known-good entitlement status.
///
/// Reads are synchronous and never touch the network. Writes happen only on
/// cascade success or bridge injection; a failed run never overwrites an
/// entry, so stale-but-valid always beats undefined. Entries write through
/// to the client-local store and survive session restarts. There is no TTL:
/// a stale entry stays servable until superseded.
pub struct StatusCache {
    store: Arc<dyn ClientStore>,
    entries: Mutex<HashMap<UserId, CacheEntry>>,
}

impl StatusCache {
    #[must_use]
    pub fn new(store: Arc<dyn ClientStore>) -> Self {
        Self {
            store,
            entries: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn get(&self, identity: &UserId) -> Option<CacheEntry> {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.get(identity) {
            return Some(entry.clone());
        }
        // Fall back to the persisted copy from an earlier session.
        let raw = self.store.get(&store::status_key(identity))?;
        match serde_json::from_str::<CacheEntry>(&raw) {
            Ok(entry) => {
                entries.insert(identity.clone(), entry.clone());
                Some(entry)
            }
            Err(e) => {
                tracing::warn!(identity = %identity, error = %e, "discarding unreadable persisted status");
                None
            }
        }
    }

    pub fn put(&self, entry: CacheEntry) {
        match serde_json::to_string(&entry) {
            Ok(json) => self.store.set(&store::status_key(&entry.identity), &json),
            Err(e) => tracing::warn!(error = %e, "failed to persist status entry"),
        }
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entry.identity.clone(), entry);
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;
    use crate::store::MemoryStore;
    use crate::types::{EndpointKind, EntitlementStatus, StatusProvenance};

    fn entry(identity: &UserId) -> CacheEntry {
        CacheEntry {
            identity: identity.clone(),
            status: EntitlementStatus::Premium {
                expires_at: Some(datetime!(2025-01-01 00:00:00 UTC)),
            },
            fetched_at: datetime!(2024-12-01 00:00:00 UTC),
            provenance: StatusProvenance::Endpoint(EndpointKind::Standard),
        }
    }

    #[test]
    fn put_then_get() {
        let cache = StatusCache::new(Arc::new(MemoryStore::new()));
        let id: UserId = "42".parse().unwrap();
        assert!(cache.get(&id).is_none());
        cache.put(entry(&id));
        assert_eq!(cache.get(&id).unwrap(), entry(&id));
    }

    #[test]
    fn entries_survive_cache_recreation_over_same_store() {
        let store = Arc::new(MemoryStore::new());
        let id: UserId = "42".parse().unwrap();
        StatusCache::new(store.clone()).put(entry(&id));

        let reopened = StatusCache::new(store);
        let restored = reopened.get(&id).unwrap();
        assert_eq!(restored, entry(&id));
        // Round-trip preserves the expiry timestamp exactly.
        assert_eq!(
            restored.status,
            EntitlementStatus::Premium {
                expires_at: Some(datetime!(2025-01-01 00:00:00 UTC)),
            }
        );
    }

    #[test]
    fn repeated_reads_are_stable() {
        let cache = StatusCache::new(Arc::new(MemoryStore::new()));
        let id: UserId = "42".parse().unwrap();
        cache.put(entry(&id));
        assert_eq!(cache.get(&id), cache.get(&id));
    }

    #[test]
    fn entries_are_per_identity() {
        let cache = StatusCache::new(Arc::new(MemoryStore::new()));
        let a: UserId = "1".parse().unwrap();
        let b: UserId = "2".parse().unwrap();
        cache.put(entry(&a));
        assert!(cache.get(&b).is_none());
    }

    #[test]
    fn corrupt_persisted_entry_is_discarded() {
        let store = Arc::new(MemoryStore::new());
        let id: UserId = "42".parse().unwrap();
        store.set(&store::status_key(&id), "not json");
        let cache = StatusCache::new(store);
        assert!(cache.get(&id).is_none());
    }
}
