use sha2::{Digest, Sha256};
use std::fmt::Write as _;

/// Selects the cache partition: public responses share one namespace;
/// private (authenticated) responses partition by a truncated hash of the
/// caller's credential so one caller can never read another's cached body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Partition {
    Public,
    PrivateAnonymous,
    Private(String),
}

impl Partition {
    /// `auth_header` is the raw `Authorization` (or equivalent) header
    /// value, if present. Hashed rather than stored verbatim so the cache
    /// key itself never carries a credential.
    pub fn resolve(is_public_policy: bool, auth_header: Option<&str>) -> Self {
        if is_public_policy {
            return Partition::Public;
        }
        match auth_header {
            None => Partition::PrivateAnonymous,
            Some(value) => {
                let mut hasher = Sha256::new();
                hasher.update(value.as_bytes());
                let digest = hasher.finalize();
                let mut hex = String::with_capacity(16);
                for byte in digest.iter().take(8) {
                    let _ = write!(hex, "{:02x}", byte);
                }
                Partition::Private(hex)
            }
        }
    }

    fn as_token(&self) -> String {
        match self {
            Partition::Public => "public".to_string(),
            Partition::PrivateAnonymous => "priv:anon".to_string(),
            Partition::Private(hash) => format!("priv:{hash}"),
        }
    }
}

/// `m=<METHOD>|h=<host-lowercased>|u=<path[?raw_query]>|(v=<header>:<values>|)*|p=<partition>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn build(
        method: &str,
        host: &str,
        path: &str,
        raw_query: Option<&str>,
        vary_headers: &[(String, String)],
        partition: &Partition,
    ) -> Self {
        let mut key = String::new();
        let _ = write!(key, "m={}|h={}|u={}", method, host.to_ascii_lowercase(), path);
        if let Some(query) = raw_query.filter(|q| !q.is_empty()) {
            let _ = write!(key, "?{query}");
        }
        for (name, value) in vary_headers {
            let _ = write!(key, "|v={name}:{value}");
        }
        let _ = write!(key, "|p={}", partition.as_token());
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_partition_ignores_auth_header() {
        let a = Partition::resolve(true, Some("Bearer abc"));
        let b = Partition::resolve(true, None);
        assert_eq!(a, Partition::Public);
        assert_eq!(b, Partition::Public);
    }

    #[test]
    fn private_without_auth_is_anonymous() {
        assert_eq!(Partition::resolve(false, None), Partition::PrivateAnonymous);
    }

    #[test]
    fn private_with_auth_hashes_to_16_hex_chars() {
        let p = Partition::resolve(false, Some("Bearer token-a"));
        match p {
            Partition::Private(hash) => assert_eq!(hash.len(), 16),
            other => panic!("expected Private, got {other:?}"),
        }
    }

    #[test]
    fn same_credential_hashes_identically() {
        let a = Partition::resolve(false, Some("Bearer token-a"));
        let b = Partition::resolve(false, Some("Bearer token-a"));
        assert_eq!(a, b);
    }

    #[test]
    fn different_credentials_hash_differently() {
        let a = Partition::resolve(false, Some("Bearer token-a"));
        let b = Partition::resolve(false, Some("Bearer token-b"));
        assert_ne!(a, b);
    }

    #[test]
    fn key_grammar_matches_expected_shape() {
        let key = CacheKey::build(
            "GET",
            "Example.com",
            "/widgets",
            Some("id=1"),
            &[("accept-encoding".into(), "gzip".into())],
            &Partition::Public,
        );
        assert_eq!(
            key.as_str(),
            "m=GET|h=example.com|u=/widgets?id=1|v=accept-encoding:gzip|p=public"
        );
    }

    #[test]
    fn empty_raw_query_omits_question_mark() {
        let key = CacheKey::build("GET", "h", "/p", Some(""), &[], &Partition::Public);
        assert_eq!(key.as_str(), "m=GET|h=h|u=/p|p=public");
    }
}
