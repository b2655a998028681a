//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request path
//!     → router.rs (route lookup, registration order)
//!     → matcher.rs (segment-aligned prefix check)
//!     → Return: matched Route or NoMatch
//!
//! Route Compilation (at startup):
//!     RouteConfig[]
//!     → Validate prefixes and backends
//!     → Parse backend URLs once
//!     → Freeze as immutable RouteTable
//! ```
//!
//! # Design Decisions
//! - Routes compiled at startup, immutable at runtime
//! - One table serves ordinary requests and WebSocket upgrades
//! - Deterministic: same input always matches same route
//! - First match wins (registration order, no longest-match reordering)

pub mod matcher;
pub mod router;

pub use router::{Backend, Route, RouteTable, Transport};
