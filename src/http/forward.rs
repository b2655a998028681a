//! Request/response relay to a resolved backend.
//!
//! # Responsibilities
//! - Rewrite the request URI onto the backend, keeping the full inbound path
//! - Copy headers minus hop-by-hop ones, rewrite `Host` and the forwarding chain
//! - Stream the body both ways without buffering
//! - Map transport failures onto 502 and 504
//!
//! # Design Decisions
//! - One pooled client shared by every route
//! - No retries: a failed forward is reported, never replayed
//! - The timeout bounds waiting for response headers only

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, request, HeaderMap, HeaderName, Method, Request, Response, Version};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;

use crate::config::validation::ValidationError;
use crate::config::{ConfigError, ForwardingConfig};
use crate::error::GatewayError;
use crate::http::pipeline::Admitted;
use crate::routing::Route;
use crate::security::headers::strip_hop_by_hop;
use crate::security::ForwardedChain;

/// One request on its way to a backend.
#[derive(Debug)]
pub struct ProxiedRequest {
    pub method: Method,
    /// Path and query exactly as received.
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Body,
    pub route: Arc<Route>,
    pub chain: ForwardedChain,
}

impl ProxiedRequest {
    pub fn new(request: Request<Body>, admitted: Admitted) -> Self {
        let (parts, body) = request.into_parts();
        let request::Parts {
            method,
            uri,
            headers,
            ..
        } = parts;
        let path_and_query = uri
            .path_and_query()
            .map_or_else(|| uri.path().to_string(), |pq| pq.as_str().to_string());

        Self {
            method,
            path_and_query,
            headers,
            body,
            route: admitted.route,
            chain: admitted.chain,
        }
    }
}

/// Pooled HTTP client plus the header rewriting rules.
#[derive(Clone)]
pub struct Forwarder {
    client: Client<HttpConnector, Body>,
    timeout: Duration,
    change_origin: bool,
    strip_hop_by_hop: bool,
    forwarded_header: HeaderName,
}

impl Forwarder {
    pub fn new(config: &ForwardingConfig) -> Result<Self, ConfigError> {
        let forwarded_header = HeaderName::from_bytes(config.forwarded_for_header.as_bytes())
            .map_err(|_| {
                ConfigError::Validation(vec![ValidationError::InvalidHeaderName(
                    config.forwarded_for_header.clone(),
                )])
            })?;

        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(config.connect_timeout()));
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(config.pool_idle_timeout())
            .build(connector);

        Ok(Self {
            client,
            timeout: config.timeout(),
            change_origin: config.change_origin,
            strip_hop_by_hop: config.strip_hop_by_hop,
            forwarded_header,
        })
    }

    pub fn forwarded_header(&self) -> &HeaderName {
        &self.forwarded_header
    }

    /// Relay `proxied` and stream the backend's answer back.
    pub async fn forward(&self, proxied: ProxiedRequest) -> Result<Response<Body>, GatewayError> {
        let backend = &proxied.route.backend;
        let uri = backend
            .target_uri(&proxied.path_and_query)
            .map_err(|e| GatewayError::MalformedRequest(e.to_string()))?;

        let mut headers = proxied.headers;
        self.rewrite_headers(&mut headers, &proxied.route, &proxied.chain);

        let mut outbound = Request::builder()
            .method(proxied.method)
            .uri(uri)
            // the pooled client speaks HTTP/1.1 upstream whatever the client used
            .version(Version::HTTP_11)
            .body(proxied.body)
            .map_err(|e| GatewayError::MalformedRequest(e.to_string()))?;
        *outbound.headers_mut() = headers;

        let response = match tokio::time::timeout(self.timeout, self.client.request(outbound)).await
        {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                tracing::error!(
                    backend = %backend,
                    connect = e.is_connect(),
                    error = %e,
                    "Upstream error"
                );
                return Err(GatewayError::BackendUnreachable {
                    backend: backend.to_string(),
                    source: Box::new(e),
                });
            }
            Err(_) => {
                tracing::error!(backend = %backend, timeout = ?self.timeout, "Upstream timed out");
                return Err(GatewayError::BackendTimeout {
                    backend: backend.to_string(),
                    timeout: self.timeout,
                });
            }
        };

        let (mut parts, body) = response.into_parts();
        if self.strip_hop_by_hop {
            strip_hop_by_hop(&mut parts.headers);
        }
        Ok(Response::from_parts(parts, Body::new(body)))
    }

    fn rewrite_headers(&self, headers: &mut HeaderMap, route: &Route, chain: &ForwardedChain) {
        if self.strip_hop_by_hop {
            strip_hop_by_hop(headers);
        }
        if self.change_origin {
            headers.insert(header::HOST, route.backend.host_header());
        }
        headers.insert(self.forwarded_header.clone(), chain.header_value());
    }
}

impl std::fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forwarder")
            .field("timeout", &self.timeout)
            .field("change_origin", &self.change_origin)
            .field("forwarded_header", &self.forwarded_header)
            .finish()
    }
}
