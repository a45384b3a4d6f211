use crate::entry::CacheEntry;
use crate::key::CacheKey;
use std::collections::HashMap;
use std::sync::RwLock;

/// In-memory cache store, one lock guarding the whole map. The teacher's
/// `migux_cache::MemoryCacheStore` uses the same shape; this adds the
/// per-set size check the spec's `CachePolicy.max_object_bytes` requires.
#[derive(Default)]
pub struct CacheStore {
    inner: RwLock<HashMap<CacheKey, CacheEntry>>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SetError {
    TooLarge { body_bytes: usize, max_object_bytes: usize },
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.inner.read().unwrap().get(key).cloned()
    }

    pub fn set(&self, key: CacheKey, entry: CacheEntry, max_object_bytes: usize) -> Result<(), SetError> {
        if entry.body.len() > max_object_bytes {
            return Err(SetError::TooLarge {
                body_bytes: entry.body.len(),
                max_object_bytes,
            });
        }
        self.inner.write().unwrap().insert(key, entry);
        Ok(())
    }

    /// Removes an entry. Used both for eviction and for the `no-store`
    /// invalidation path (Open Question Resolution #2).
    pub fn delete(&self, key: &CacheKey) {
        self.inner.write().unwrap().remove(key);
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop any entries that expired before `now_millis`. Intended to be
    /// driven by a periodic background tick, not the request path.
    pub fn sweep_expired(&self, now_millis: u64) {
        self.inner.write().unwrap().retain(|_, e| e.is_fresh(now_millis));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Partition;
    use bytes::Bytes;
    use http::{HeaderMap, StatusCode};

    fn entry(body: &'static [u8], expires_at: u64) -> CacheEntry {
        CacheEntry {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::from_static(body),
            stored_at_millis: 0,
            expires_at_millis: expires_at,
        }
    }

    fn key() -> CacheKey {
        CacheKey::build("GET", "h", "/p", None, &[], &Partition::Public)
    }

    #[test]
    fn set_then_get_round_trips() {
        let store = CacheStore::new();
        store.set(key(), entry(b"hi", 1_000), 1024).unwrap();
        assert!(store.get(&key()).is_some());
    }

    #[test]
    fn set_rejects_body_over_max_object_bytes() {
        let store = CacheStore::new();
        let err = store.set(key(), entry(b"hello", 1_000), 2).unwrap_err();
        assert_eq!(
            err,
            SetError::TooLarge { body_bytes: 5, max_object_bytes: 2 }
        );
        assert!(store.get(&key()).is_none());
    }

    #[test]
    fn delete_removes_entry() {
        let store = CacheStore::new();
        store.set(key(), entry(b"hi", 1_000), 1024).unwrap();
        store.delete(&key());
        assert!(store.get(&key()).is_none());
    }

    #[test]
    fn sweep_expired_drops_stale_entries_only() {
        let store = CacheStore::new();
        let fresh_key = CacheKey::build("GET", "h", "/fresh", None, &[], &Partition::Public);
        store.set(key(), entry(b"stale", 100), 1024).unwrap();
        store.set(fresh_key.clone(), entry(b"fresh", 10_000), 1024).unwrap();
        store.sweep_expired(5_000);
        assert!(store.get(&key()).is_none());
        assert!(store.get(&fresh_key).is_some());
    }
}
