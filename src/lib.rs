//! API gateway library: path-prefix routing, a shared fixed-window rate
//! limiter, forwarding-chain handling, HTTP forwarding and listener-level
//! protocol upgrade dispatch.

pub mod config;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod routing;
pub mod security;

pub use config::schema::GatewayConfig;
pub use error::GatewayError;
pub use http::GatewayServer;
pub use lifecycle::Shutdown;
