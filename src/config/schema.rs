//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the API gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener configuration (bind address, connection limits).
    pub listener: ListenerConfig,

    /// Route definitions, evaluated in the order they appear.
    pub routes: Vec<RouteConfig>,

    /// Rate limiting configuration.
    pub rate_limit: RateLimitConfig,

    /// Backend forwarding behaviour.
    pub forwarding: ForwardingConfig,

    /// CORS allow-list.
    pub cors: CorsConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,

    /// Time allowed for a client to send a request head. On kept-alive
    /// connections this also bounds the idle wait for the next request.
    pub header_read_timeout_secs: u64,

    /// Largest request head accepted before the connection is refused.
    pub max_header_bytes: usize,

    /// How long shutdown waits for open connections to finish.
    pub shutdown_drain_secs: u64,
}

impl ListenerConfig {
    pub fn header_read_timeout(&self) -> Duration {
        Duration::from_secs(self.header_read_timeout_secs)
    }

    pub fn shutdown_drain(&self) -> Duration {
        Duration::from_secs(self.shutdown_drain_secs)
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            max_connections: 10_000,
            header_read_timeout_secs: 10,
            max_header_bytes: 16 * 1024,
            shutdown_drain_secs: 10,
        }
    }
}

/// A single route: path prefix to backend.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RouteConfig {
    /// Path prefix to match, segment aligned.
    pub prefix: String,

    /// Backend base URL (e.g., "http://127.0.0.1:3001").
    pub backend: String,

    /// Whether WebSocket upgrades are relayed on this prefix.
    #[serde(default)]
    pub websocket: bool,
}

/// Fixed-window rate limiting configuration.
///
/// One limiter is shared by every route, so a client's budget covers all of
/// them together.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting.
    pub enabled: bool,

    /// Window length in seconds.
    pub window_secs: u64,

    /// Requests admitted per identity within one window.
    pub max_requests: u32,

    /// Interval between sweeps of expired windows.
    pub sweep_interval_secs: u64,

    /// Body of the 429 response.
    pub message: String,
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_secs: 15 * 60,
            max_requests: 300,
            sweep_interval_secs: 60,
            message: "Too many requests from this IP, please try again later.".to_string(),
        }
    }
}

/// Forwarding behaviour toward backends.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ForwardingConfig {
    /// Time to wait for backend response headers, in seconds.
    pub timeout_secs: u64,

    /// TCP connect timeout in seconds.
    pub connect_timeout_secs: u64,

    /// Idle pooled connections kept per backend.
    pub pool_max_idle_per_host: usize,

    /// Idle pooled connection lifetime in seconds.
    pub pool_idle_timeout_secs: u64,

    /// Rewrite `Host` to the backend authority.
    pub change_origin: bool,

    /// Name of the forwarding-chain header.
    pub forwarded_for_header: String,

    /// Strip hop-by-hop headers in both directions.
    pub strip_hop_by_hop: bool,
}

impl ForwardingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            connect_timeout_secs: 5,
            pool_max_idle_per_host: 32,
            pool_idle_timeout_secs: 90,
            change_origin: true,
            forwarded_for_header: "x-forwarded-for".to_string(),
            strip_hop_by_hop: true,
        }
    }
}

/// CORS configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CorsConfig {
    /// Origins allowed to make credentialed cross-origin requests.
    pub allowed_origins: Vec<String>,

    pub allowed_methods: Vec<String>,

    pub allowed_headers: Vec<String>,

    pub allow_credentials: bool,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: Vec::new(),
            allowed_methods: ["GET", "POST", "PUT", "DELETE"]
                .map(String::from)
                .to_vec(),
            allowed_headers: ["content-type", "authorization"]
                .map(String::from)
                .to_vec(),
            allow_credentials: true,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
