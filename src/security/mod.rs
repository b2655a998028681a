//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request:
//!     → forwarded.rs (extend X-Forwarded-For, derive client identity)
//!     → rate_limit.rs (fixed window per identity, shared by all routes)
//!     → headers.rs (strip hop-by-hop, detect upgrades)
//!     → Pass to routing
//!
//! Browser preflight:
//!     → cors.rs (allow-listed origins only)
//! ```
//!
//! # Design Decisions
//! - The chain is appended, never overwritten
//! - The first hop is the identity, so inner hops cannot dodge the limit
//! - Fail closed: reject on any admission failure

pub mod cors;
pub mod forwarded;
pub mod headers;
pub mod rate_limit;

pub use forwarded::{ClientIdentity, ForwardedChain};
pub use rate_limit::{Admission, FixedWindowLimiter};
