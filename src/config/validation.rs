//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Route table invariants (non-empty, absolute, unique prefixes)
//! - Backend URLs the forwarder can actually reach
//! - Value ranges (timeouts > 0, limits > 0)
//!
//! Returns all validation errors, not just the first.

use std::collections::HashSet;
use std::net::SocketAddr;

use axum::http::{HeaderName, HeaderValue};
use thiserror::Error;
use url::Url;

use crate::config::schema::{GatewayConfig, RouteConfig};

/// A single semantic problem found in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("at least one route must be configured")]
    NoRoutes,

    #[error("route #{index} has an empty prefix")]
    EmptyPrefix { index: usize },

    #[error("route prefix `{prefix}` must start with '/'")]
    RelativePrefix { prefix: String },

    #[error("route prefix `{prefix}` is registered more than once")]
    DuplicatePrefix { prefix: String },

    #[error("backend `{backend}` for `{prefix}` is invalid: {reason}")]
    InvalidBackend {
        prefix: String,
        backend: String,
        reason: String,
    },

    #[error("invalid bind address `{0}`")]
    InvalidBindAddress(String),

    #[error("listener.max_connections must be greater than zero")]
    ZeroConnections,

    #[error("listener.header_read_timeout_secs must be greater than zero")]
    ZeroHeaderReadTimeout,

    #[error("listener.max_header_bytes must be greater than zero")]
    ZeroMaxHeaderBytes,

    #[error("rate_limit.window_secs must be greater than zero")]
    ZeroWindow,

    #[error("rate_limit.max_requests must be greater than zero")]
    ZeroMaxRequests,

    #[error("rate_limit.sweep_interval_secs must be greater than zero")]
    ZeroSweepInterval,

    #[error("forwarding.timeout_secs must be greater than zero")]
    ZeroForwardTimeout,

    #[error("`{0}` is not a valid header name")]
    InvalidHeaderName(String),

    #[error("`{0}` is not a valid CORS origin")]
    InvalidOrigin(String),

    #[error("`{0}` is not a valid HTTP method")]
    InvalidMethod(String),

    #[error("cors.{0} cannot contain `*` while credentials are allowed")]
    CorsWildcard(&'static str),
}

/// Check every semantic invariant of `config`.
pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidBindAddress(
            config.listener.bind_address.clone(),
        ));
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::ZeroConnections);
    }
    if config.listener.header_read_timeout_secs == 0 {
        errors.push(ValidationError::ZeroHeaderReadTimeout);
    }
    if config.listener.max_header_bytes == 0 {
        errors.push(ValidationError::ZeroMaxHeaderBytes);
    }

    validate_routes(&config.routes, &mut errors);

    let rate_limit = &config.rate_limit;
    if rate_limit.enabled {
        if rate_limit.window_secs == 0 {
            errors.push(ValidationError::ZeroWindow);
        }
        if rate_limit.max_requests == 0 {
            errors.push(ValidationError::ZeroMaxRequests);
        }
        if rate_limit.sweep_interval_secs == 0 {
            errors.push(ValidationError::ZeroSweepInterval);
        }
    }

    if config.forwarding.timeout_secs == 0 {
        errors.push(ValidationError::ZeroForwardTimeout);
    }
    if HeaderName::from_bytes(config.forwarding.forwarded_for_header.as_bytes()).is_err() {
        errors.push(ValidationError::InvalidHeaderName(
            config.forwarding.forwarded_for_header.clone(),
        ));
    }

    for origin in &config.cors.allowed_origins {
        if Url::parse(origin).is_err() || HeaderValue::from_str(origin).is_err() {
            errors.push(ValidationError::InvalidOrigin(origin.clone()));
        }
    }
    for method in &config.cors.allowed_methods {
        if method.parse::<axum::http::Method>().is_err() {
            errors.push(ValidationError::InvalidMethod(method.clone()));
        }
    }
    for header in &config.cors.allowed_headers {
        if HeaderName::from_bytes(header.as_bytes()).is_err() {
            errors.push(ValidationError::InvalidHeaderName(header.clone()));
        }
    }
    // tower-http refuses a wildcard alongside credentials
    if config.cors.allow_credentials {
        if config.cors.allowed_methods.iter().any(|m| m.trim() == "*") {
            errors.push(ValidationError::CorsWildcard("allowed_methods"));
        }
        if config.cors.allowed_headers.iter().any(|h| h.trim() == "*") {
            errors.push(ValidationError::CorsWildcard("allowed_headers"));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Route table invariants; shared with `RouteTable::from_config`.
pub(crate) fn validate_routes(routes: &[RouteConfig], errors: &mut Vec<ValidationError>) {
    if routes.is_empty() {
        errors.push(ValidationError::NoRoutes);
    }

    let mut seen = HashSet::new();
    for (index, route) in routes.iter().enumerate() {
        if route.prefix.is_empty() {
            errors.push(ValidationError::EmptyPrefix { index });
        } else if !route.prefix.starts_with('/') {
            errors.push(ValidationError::RelativePrefix {
                prefix: route.prefix.clone(),
            });
        } else if !seen.insert(route.prefix.as_str()) {
            errors.push(ValidationError::DuplicatePrefix {
                prefix: route.prefix.clone(),
            });
        }

        if let Err(reason) = check_backend(&route.backend) {
            errors.push(ValidationError::InvalidBackend {
                prefix: route.prefix.clone(),
                backend: route.backend.clone(),
                reason,
            });
        }
    }
}

/// Backends are plain HTTP with an explicit host; TLS toward backends is not
/// supported by the forwarder's connector.
pub(crate) fn check_backend(backend: &str) -> Result<Url, String> {
    let url = Url::parse(backend).map_err(|e| e.to_string())?;
    if url.scheme() != "http" {
        return Err(format!("unsupported scheme `{}`", url.scheme()));
    }
    if url.host_str().is_none() {
        return Err("missing host".to_string());
    }
    if url.query().is_some() || url.fragment().is_some() {
        return Err("query and fragment are not allowed".to_string());
    }
    Ok(url)
}
