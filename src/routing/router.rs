//! Route lookup and dispatch.
//!
//! # Responsibilities
//! - Store compiled routes in registration order
//! - Look up the first route matching a request path
//! - Return matched route or explicit no-match
//!
//! # Design Decisions
//! - Immutable after construction (thread-safe without locks)
//! - O(n) path prefix scan (acceptable for typical route counts)
//! - Explicit NoMatch rather than silent default

use std::fmt;
use std::sync::Arc;

use axum::http::uri::{Authority, PathAndQuery, Scheme};
use axum::http::{HeaderValue, Uri};
use url::Url;

use crate::config::validation::{check_backend, validate_routes, ValidationError};
use crate::config::{ConfigError, RouteConfig};
use crate::routing::matcher::PathPrefixMatcher;

/// How a route may be used by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Ordinary request/response only.
    Http,
    /// Ordinary requests plus protocol upgrades (WebSocket).
    HttpAndUpgrade,
}

impl Transport {
    pub fn supports_upgrade(self) -> bool {
        matches!(self, Transport::HttpAndUpgrade)
    }
}

/// An upstream service address, pre-parsed for the hot path.
#[derive(Debug, Clone)]
pub struct Backend {
    url: Url,
    authority: Authority,
    /// Backend URL path without its trailing slash; empty for the root.
    base_path: String,
}

impl Backend {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let url = check_backend(raw)?;
        let host = url.host_str().ok_or("missing host")?;
        let authority = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        let authority: Authority = authority.parse().map_err(|e| format!("{e}"))?;
        let base_path = url.path().trim_end_matches('/').to_string();
        Ok(Self {
            url,
            authority,
            base_path,
        })
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    /// `host:port` suitable for a raw TCP connect.
    pub fn socket_address(&self) -> String {
        let host = self.authority.host();
        let port = self.url.port_or_known_default().unwrap_or(80);
        format!("{host}:{port}")
    }

    /// Value for a rewritten `Host` header.
    pub fn host_header(&self) -> HeaderValue {
        HeaderValue::from_str(self.authority.as_str())
            .unwrap_or_else(|_| HeaderValue::from_static("localhost"))
    }

    /// Path and query forwarded upstream; the inbound path is kept whole and
    /// placed under the backend's base path.
    pub fn target_path(&self, path_and_query: &str) -> String {
        format!("{}{}", self.base_path, path_and_query)
    }

    /// Absolute URI of the upstream resource for `path_and_query`.
    pub fn target_uri(&self, path_and_query: &str) -> Result<Uri, axum::http::Error> {
        let path: PathAndQuery = self.target_path(path_and_query).parse()?;
        Ok(Uri::builder()
            .scheme(Scheme::HTTP)
            .authority(self.authority.clone())
            .path_and_query(path)
            .build()?)
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

/// A compiled route: prefix, backend and transport.
#[derive(Debug, Clone)]
pub struct Route {
    matcher: PathPrefixMatcher,
    pub backend: Backend,
    pub transport: Transport,
}

impl Route {
    pub fn new(prefix: impl Into<String>, backend: Backend, transport: Transport) -> Self {
        Self {
            matcher: PathPrefixMatcher::new(prefix),
            backend,
            transport,
        }
    }

    pub fn prefix(&self) -> &str {
        self.matcher.prefix()
    }

    pub fn supports_upgrade(&self) -> bool {
        self.transport.supports_upgrade()
    }

    pub fn matches(&self, path: &str) -> bool {
        self.matcher.matches(path)
    }
}

/// Immutable route table shared by ordinary requests and upgrades.
#[derive(Debug, Clone)]
pub struct RouteTable {
    routes: Vec<Arc<Route>>,
}

impl RouteTable {
    /// Compile routes from configuration, preserving their order.
    ///
    /// Any invariant violation is a fatal configuration error.
    pub fn from_config(routes: &[RouteConfig]) -> Result<Self, ConfigError> {
        let mut errors = Vec::new();
        validate_routes(routes, &mut errors);
        if !errors.is_empty() {
            return Err(ConfigError::Validation(errors));
        }

        let mut compiled = Vec::with_capacity(routes.len());
        for config in routes {
            // validate_routes has already vetted every backend
            let backend = Backend::parse(&config.backend).map_err(|reason| {
                ConfigError::Validation(vec![ValidationError::InvalidBackend {
                    prefix: config.prefix.clone(),
                    backend: config.backend.clone(),
                    reason,
                }])
            })?;
            let transport = if config.websocket {
                Transport::HttpAndUpgrade
            } else {
                Transport::Http
            };
            compiled.push(Arc::new(Route::new(config.prefix.clone(), backend, transport)));
        }

        tracing::info!(routes = compiled.len(), "Route table compiled");
        for route in &compiled {
            tracing::debug!(
                prefix = %route.prefix(),
                backend = %route.backend,
                upgrade = route.supports_upgrade(),
                "Route registered"
            );
        }

        Ok(Self { routes: compiled })
    }

    /// First route, in registration order, whose prefix matches `path`.
    pub fn resolve(&self, path: &str) -> Option<&Arc<Route>> {
        self.routes.iter().find(|route| route.matches(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(prefix: &str, backend: &str, websocket: bool) -> RouteConfig {
        RouteConfig {
            prefix: prefix.into(),
            backend: backend.into(),
            websocket,
        }
    }

    fn reference_table() -> RouteTable {
        RouteTable::from_config(&[
            route("/api/v1/user", "http://users:3001", false),
            route("/api/v1/post", "http://posts:3002", false),
            route("/api/v1/feed", "http://feed:3003", false),
            route("/api/v1/chat", "http://chat:3004", true),
            route("/api/v1/notification", "http://notify:3005", true),
        ])
        .unwrap()
    }

    #[test]
    fn resolves_segment_aligned_prefixes() {
        let table = reference_table();
        assert_eq!(table.resolve("/api/v1/user/123").unwrap().prefix(), "/api/v1/user");
        assert_eq!(table.resolve("/api/v1/chat").unwrap().prefix(), "/api/v1/chat");
        assert!(table.resolve("/api/v1/users").is_none());
        assert!(table.resolve("/health").is_none());
        assert!(table.resolve("/").is_none());
    }

    #[test]
    fn first_registered_match_wins() {
        let table = RouteTable::from_config(&[
            route("/api", "http://general:1", false),
            route("/api/v1/user", "http://users:2", false),
        ])
        .unwrap();
        let matched = table.resolve("/api/v1/user/7").unwrap();
        assert_eq!(matched.prefix(), "/api");
        assert_eq!(matched.backend.authority().as_str(), "general:1");
    }

    #[test]
    fn transport_follows_websocket_flag() {
        let table = reference_table();
        assert!(table.resolve("/api/v1/chat/room").unwrap().supports_upgrade());
        assert!(!table.resolve("/api/v1/user").unwrap().supports_upgrade());
    }

    #[test]
    fn rejects_empty_prefix_at_startup() {
        let err = RouteTable::from_config(&[route("", "http://users:1", false)]).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn target_uri_keeps_prefix_and_query() {
        let backend = Backend::parse("http://users:3001").unwrap();
        let uri = backend.target_uri("/api/v1/user/42?full=true").unwrap();
        assert_eq!(uri.to_string(), "http://users:3001/api/v1/user/42?full=true");

        let nested = Backend::parse("http://10.0.0.5/svc/").unwrap();
        assert_eq!(nested.target_path("/api/v1/post"), "/svc/api/v1/post");
        assert_eq!(nested.socket_address(), "10.0.0.5:80");
        assert_eq!(nested.host_header(), "10.0.0.5");
    }
}
