//! Request-scoped gateway errors.
//!
//! Every variant is terminal for the one request or connection it affects.

use std::time::Duration;

use axum::http::StatusCode;
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Why an upgrade attempt was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum UpgradeRejection {
    /// The matched route only serves ordinary requests.
    #[error("route does not accept upgrades")]
    NotUpgradeCapable,
    /// Required handshake headers are missing or inconsistent.
    #[error("malformed handshake: {0}")]
    MalformedHandshake(&'static str),
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("no route matches `{path}`")]
    RouteNotFound { path: String },

    #[error("rate limit exceeded for {identity}")]
    RateLimitExceeded {
        identity: String,
        retry_after: Duration,
        message: String,
    },

    #[error("backend {backend} unreachable: {source}")]
    BackendUnreachable {
        backend: String,
        #[source]
        source: BoxError,
    },

    #[error("backend {backend} did not respond within {timeout:?}")]
    BackendTimeout { backend: String, timeout: Duration },

    #[error("upgrade rejected: {0}")]
    UpgradeRejected(UpgradeRejection),

    #[error("malformed request: {0}")]
    MalformedRequest(String),
}

impl GatewayError {
    /// HTTP status sent to the client, or `None` when the connection is
    /// closed without a response.
    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            GatewayError::RouteNotFound { .. } => Some(StatusCode::NOT_FOUND),
            GatewayError::RateLimitExceeded { .. } => Some(StatusCode::TOO_MANY_REQUESTS),
            GatewayError::BackendUnreachable { .. } => Some(StatusCode::BAD_GATEWAY),
            GatewayError::BackendTimeout { .. } => Some(StatusCode::GATEWAY_TIMEOUT),
            GatewayError::UpgradeRejected(_) => None,
            GatewayError::MalformedRequest(_) => Some(StatusCode::BAD_REQUEST),
        }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::RouteNotFound { .. } => "route_not_found",
            GatewayError::RateLimitExceeded { .. } => "rate_limited",
            GatewayError::BackendUnreachable { .. } => "backend_unreachable",
            GatewayError::BackendTimeout { .. } => "backend_timeout",
            GatewayError::UpgradeRejected(_) => "upgrade_rejected",
            GatewayError::MalformedRequest(_) => "malformed_request",
        }
    }

    /// Text sent as the response body.
    pub fn client_message(&self) -> String {
        match self {
            GatewayError::RouteNotFound { .. } => "No matching route found".to_string(),
            GatewayError::RateLimitExceeded { message, .. } => message.clone(),
            GatewayError::BackendUnreachable { .. } => "Upstream request failed".to_string(),
            GatewayError::BackendTimeout { .. } => "Upstream request timed out".to_string(),
            GatewayError::UpgradeRejected(reason) => reason.to_string(),
            GatewayError::MalformedRequest(_) => "Bad request".to_string(),
        }
    }

    /// Whole seconds a rate-limited client should wait, rounded up.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            GatewayError::RateLimitExceeded { retry_after, .. } => {
                let mut secs = retry_after.as_secs();
                if retry_after.subsec_nanos() > 0 {
                    secs += 1;
                }
                Some(secs.max(1))
            }
            _ => None,
        }
    }
}
