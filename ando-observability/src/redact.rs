//! Header and query-string redaction for the access log, grounded in the
//! teacher's `pii_scrubber` module but narrowed to the fixed sensitive-header
//! set named by spec §6 (no operator-configurable extra list, no IP
//! anonymization — `client_ip` is logged as-is per the resolved open
//! question on `RemoteAddr`-only extraction).

pub const REDACTED: &str = "[redacted]";

/// Headers whose values are always replaced with `[redacted]` in logs.
pub const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "cookie",
    "set-cookie",
    "x-api-key",
    "proxy-authorization",
];

fn is_sensitive(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    SENSITIVE_HEADERS.contains(&lower.as_str())
}

/// Returns `value` unchanged, or `[redacted]` if `name` is one of the fixed
/// sensitive headers (case-insensitive).
pub fn redact_header_value(name: &str, value: &str) -> String {
    if is_sensitive(name) {
        REDACTED.to_string()
    } else {
        value.to_string()
    }
}

/// Replaces the value of any sensitive header that appears as a query
/// parameter (`?authorization=...`) with `[redacted]`, leaving the rest of
/// the query string intact. Sensitive headers normally arrive as HTTP
/// headers, not query params, but some clients pass bearer tokens this way.
pub fn scrub_query(path: &str) -> String {
    let Some((base, query)) = path.split_once('?') else {
        return path.to_string();
    };
    let scrubbed: Vec<String> = query
        .split('&')
        .map(|pair| match pair.split_once('=') {
            Some((key, _)) if is_sensitive(key) => format!("{key}={REDACTED}"),
            _ => pair.to_string(),
        })
        .collect();
    format!("{base}?{}", scrubbed.join("&"))
}
