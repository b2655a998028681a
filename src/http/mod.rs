//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (accept, sniff first request head)
//!         → upgrade.rs (upgrade requests: raw handshake relay + byte pipe)
//!         → Axum router (everything else)
//!     → pipeline.rs (identity → rate limit → route)
//!     → forward.rs (rewrite headers, stream to backend and back)
//!     → response.rs (gateway errors as HTTP responses)
//! ```

pub mod forward;
pub mod pipeline;
pub mod response;
pub mod server;
pub mod upgrade;

pub use forward::{Forwarder, ProxiedRequest};
pub use pipeline::{Admitted, Pipeline, RequestContext};
pub use server::GatewayServer;
pub use upgrade::{UpgradeDispatcher, UpgradeState};
