use crate::config::LimitsConfig;
use crate::error::AndoError;

/// Resolved request limits, enforced by the handler before routing.
/// `0` means "no limit" for the byte/count fields.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_url_bytes: u64,
    pub max_header_count: u64,
    pub max_body_bytes: u64,
    pub read_header_timeout_ms: u64,
}

const DEFAULT_MAX_URL_BYTES: u64 = 8 * 1024;
const DEFAULT_MAX_HEADER_COUNT: u64 = 100;
const DEFAULT_MAX_BODY_BYTES: u64 = 10 * 1024 * 1024;
const DEFAULT_READ_HEADER_TIMEOUT_MS: u64 = 10_000;

impl Limits {
    /// Build from config, rejecting negative-equivalent nonsense and
    /// requiring a positive read-header timeout whenever any limit is set.
    pub fn build(cfg: &LimitsConfig) -> Result<Self, AndoError> {
        let any_set = cfg.max_url_bytes.is_some()
            || cfg.max_header_count.is_some()
            || cfg.max_body_bytes.is_some()
            || cfg.read_header_timeout_ms.is_some();

        let read_header_timeout_ms = cfg
            .read_header_timeout_ms
            .unwrap_or(DEFAULT_READ_HEADER_TIMEOUT_MS);

        if any_set && read_header_timeout_ms == 0 {
            return Err(AndoError::Config(
                "read_header_timeout_ms must be positive when any limit is set".into(),
            ));
        }

        Ok(Self {
            max_url_bytes: cfg.max_url_bytes.unwrap_or(DEFAULT_MAX_URL_BYTES),
            max_header_count: cfg.max_header_count.unwrap_or(DEFAULT_MAX_HEADER_COUNT),
            max_body_bytes: cfg.max_body_bytes.unwrap_or(DEFAULT_MAX_BODY_BYTES),
            read_header_timeout_ms,
        })
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_url_bytes: DEFAULT_MAX_URL_BYTES,
            max_header_count: DEFAULT_MAX_HEADER_COUNT,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            read_header_timeout_ms: DEFAULT_READ_HEADER_TIMEOUT_MS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_unset() {
        let limits = Limits::build(&LimitsConfig::default()).unwrap();
        assert_eq!(limits.max_url_bytes, DEFAULT_MAX_URL_BYTES);
        assert_eq!(limits.read_header_timeout_ms, DEFAULT_READ_HEADER_TIMEOUT_MS);
    }

    #[test]
    fn rejects_zero_read_header_timeout_when_limit_set() {
        let cfg = LimitsConfig {
            max_url_bytes: Some(1024),
            max_header_count: None,
            max_body_bytes: None,
            read_header_timeout_ms: Some(0),
        };
        assert!(Limits::build(&cfg).is_err());
    }

    #[test]
    fn zero_max_body_bytes_is_legal() {
        let cfg = LimitsConfig {
            max_url_bytes: None,
            max_header_count: None,
            max_body_bytes: Some(0),
            read_header_timeout_ms: None,
        };
        let limits = Limits::build(&cfg).unwrap();
        assert_eq!(limits.max_body_bytes, 0);
    }
}
