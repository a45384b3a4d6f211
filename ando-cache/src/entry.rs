use bytes::Bytes;
use http::{HeaderMap, StatusCode};

/// A stored response. `stored_at`/`expires_at` are epoch millis rather than
/// `Instant` so entries remain comparable across a config reload that
/// doesn't touch the cache itself.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub stored_at_millis: u64,
    pub expires_at_millis: u64,
}

impl CacheEntry {
    pub fn is_fresh(&self, now_millis: u64) -> bool {
        now_millis < self.expires_at_millis
    }

    pub fn age_millis(&self, now_millis: u64) -> u64 {
        now_millis.saturating_sub(self.stored_at_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(stored_at: u64, ttl: u64) -> CacheEntry {
        CacheEntry {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"hello"),
            stored_at_millis: stored_at,
            expires_at_millis: stored_at + ttl,
        }
    }

    #[test]
    fn fresh_before_expiry() {
        let e = entry(0, 1_000);
        assert!(e.is_fresh(999));
        assert!(!e.is_fresh(1_000));
    }

    #[test]
    fn age_is_relative_to_stored_at() {
        let e = entry(500, 1_000);
        assert_eq!(e.age_millis(700), 200);
    }
}
