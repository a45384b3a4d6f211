use http::{HeaderMap, Method, StatusCode};

/// Whether a request method is eligible for caching at all. Only GET/HEAD
/// responses are considered, same as the teacher's `CachePolicy`.
pub fn is_cacheable_method(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD)
}

pub fn is_cacheable_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 200 | 203 | 204 | 301 | 404 | 410)
}

/// Decision for what a response's cache-control headers mean for an
/// existing entry at the same key.
#[derive(Debug, PartialEq, Eq)]
pub enum ResponseDirective {
    /// Store the response with the given TTL override, if any.
    Store { ttl_override_ms: Option<u64> },
    /// Don't populate the cache; existing entry at this key is untouched.
    SkipStore,
    /// `no-store`: the conservative choice is to invalidate any existing
    /// entry at this key rather than merely skip populating it, since a
    /// `no-store` response usually means the underlying resource changed.
    Invalidate,
}

pub fn classify_response(headers: &HeaderMap) -> ResponseDirective {
    let cache_control = headers
        .get(http::header::CACHE_CONTROL)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if directive_present(cache_control, "no-store") {
        return ResponseDirective::Invalidate;
    }
    if directive_present(cache_control, "no-cache") || directive_present(cache_control, "private") {
        return ResponseDirective::SkipStore;
    }
    let ttl_override_ms = max_age(cache_control).map(|secs| secs * 1_000);
    ResponseDirective::Store { ttl_override_ms }
}

fn directive_present(cache_control: &str, directive: &str) -> bool {
    cache_control
        .split(',')
        .any(|part| part.trim().eq_ignore_ascii_case(directive))
}

fn max_age(cache_control: &str) -> Option<u64> {
    cache_control.split(',').find_map(|part| {
        let part = part.trim();
        let (name, value) = part.split_once('=')?;
        if name.trim().eq_ignore_ascii_case("max-age") {
            value.trim().parse::<u64>().ok()
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(cache_control: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(http::header::CACHE_CONTROL, cache_control.parse().unwrap());
        h
    }

    #[test]
    fn no_store_invalidates() {
        assert_eq!(classify_response(&headers("no-store")), ResponseDirective::Invalidate);
    }

    #[test]
    fn no_cache_skips_store_without_invalidating() {
        assert_eq!(classify_response(&headers("no-cache")), ResponseDirective::SkipStore);
    }

    #[test]
    fn max_age_becomes_ttl_override() {
        assert_eq!(
            classify_response(&headers("max-age=60")),
            ResponseDirective::Store { ttl_override_ms: Some(60_000) }
        );
    }

    #[test]
    fn absent_cache_control_stores_with_default_ttl() {
        assert_eq!(
            classify_response(&HeaderMap::new()),
            ResponseDirective::Store { ttl_override_ms: None }
        );
    }

    #[test]
    fn get_and_head_are_cacheable_others_are_not() {
        assert!(is_cacheable_method(&Method::GET));
        assert!(is_cacheable_method(&Method::HEAD));
        assert!(!is_cacheable_method(&Method::POST));
    }
}
