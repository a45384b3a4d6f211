use thiserror::Error;

/// Stable error categories surfaced to clients and logged on every request.
///
/// These names are part of the wire contract (JSON error body, access log
/// `error_category` field) and must not change once shipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    NoRoute,
    RequestTimeout,
    UpstreamTimeout,
    UpstreamConnectFailed,
    BadGateway,
    Overloaded,
    CircuitOpen,
    RequestTooLarge,
    UriTooLong,
    HeadersTooLarge,
    MtlsRequired,
    PluginTimeout,
    PluginUnavailable,
    Panic,
    NotFound,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::NoRoute => "no_route",
            ErrorCategory::RequestTimeout => "request_timeout",
            ErrorCategory::UpstreamTimeout => "upstream_timeout",
            ErrorCategory::UpstreamConnectFailed => "upstream_connect_failed",
            ErrorCategory::BadGateway => "bad_gateway",
            ErrorCategory::Overloaded => "overloaded",
            ErrorCategory::CircuitOpen => "circuit_open",
            ErrorCategory::RequestTooLarge => "request_too_large",
            ErrorCategory::UriTooLong => "uri_too_long",
            ErrorCategory::HeadersTooLarge => "headers_too_large",
            ErrorCategory::MtlsRequired => "mtls_required",
            ErrorCategory::PluginTimeout => "plugin_timeout",
            ErrorCategory::PluginUnavailable => "plugin_unavailable",
            ErrorCategory::Panic => "panic",
            ErrorCategory::NotFound => "not_found",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            ErrorCategory::NoRoute => 404,
            ErrorCategory::RequestTimeout => 504,
            ErrorCategory::UpstreamTimeout => 504,
            ErrorCategory::UpstreamConnectFailed => 502,
            ErrorCategory::BadGateway => 502,
            ErrorCategory::Overloaded => 503,
            ErrorCategory::CircuitOpen => 503,
            ErrorCategory::RequestTooLarge => 413,
            ErrorCategory::UriTooLong => 414,
            ErrorCategory::HeadersTooLarge => 431,
            ErrorCategory::MtlsRequired => 403,
            ErrorCategory::PluginTimeout => 503,
            ErrorCategory::PluginUnavailable => 503,
            ErrorCategory::Panic => 500,
            ErrorCategory::NotFound => 404,
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A proxy-originated error carrying a stable category plus a client-safe message.
#[derive(Error, Debug)]
#[error("{category}: {message}")]
pub struct ProxyError {
    pub category: ErrorCategory,
    pub message: String,
}

impl ProxyError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }

    pub fn status_code(&self) -> u16 {
        self.category.status_code()
    }

    /// JSON error body: `{status, request_id, error_category, message}`.
    pub fn to_json_body(&self, request_id: &str) -> serde_json::Value {
        serde_json::json!({
            "status": self.status_code(),
            "request_id": request_id,
            "error_category": self.category.as_str(),
            "message": self.message,
        })
    }
}

/// Configuration and snapshot-build errors. Never surfaced to data-plane
/// traffic — a rejected config apply leaves the previous snapshot serving.
#[derive(Error, Debug)]
pub enum AndoError {
    #[error("invalid pool {pool}: {reason}")]
    InvalidPool { pool: String, reason: String },

    #[error("invalid route {route_id}: {reason}")]
    InvalidRoute { route_id: String, reason: String },

    #[error("unknown pool {0} referenced by a route")]
    UnknownPool(String),

    #[error("duplicate route id {0}")]
    DuplicateRouteId(String),

    #[error("mTLS required but no client-CA configured")]
    MtlsMisconfigured,

    #[error("apply rejected: retired snapshot backlog at pressure ({retired}/{max})")]
    Pressure { retired: usize, max: usize },

    #[error("registry error: {0}")]
    Registry(String),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type AndoResult<T> = Result<T, AndoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_status_codes_match_spec() {
        assert_eq!(ErrorCategory::NoRoute.status_code(), 404);
        assert_eq!(ErrorCategory::RequestTimeout.status_code(), 504);
        assert_eq!(ErrorCategory::UpstreamTimeout.status_code(), 504);
        assert_eq!(ErrorCategory::UpstreamConnectFailed.status_code(), 502);
        assert_eq!(ErrorCategory::Overloaded.status_code(), 503);
        assert_eq!(ErrorCategory::CircuitOpen.status_code(), 503);
        assert_eq!(ErrorCategory::RequestTooLarge.status_code(), 413);
        assert_eq!(ErrorCategory::UriTooLong.status_code(), 414);
        assert_eq!(ErrorCategory::HeadersTooLarge.status_code(), 431);
        assert_eq!(ErrorCategory::MtlsRequired.status_code(), 403);
        assert_eq!(ErrorCategory::Panic.status_code(), 500);
    }

    #[test]
    fn json_body_has_required_fields() {
        let err = ProxyError::new(ErrorCategory::NoRoute, "no route matched");
        let body = err.to_json_body("req-123");
        assert_eq!(body["status"], 404);
        assert_eq!(body["request_id"], "req-123");
        assert_eq!(body["error_category"], "no_route");
        assert_eq!(body["message"], "no route matched");
    }

    #[test]
    fn pressure_error_display() {
        let err = AndoError::Pressure { retired: 10, max: 10 };
        assert!(err.to_string().contains("10/10"));
    }
}
