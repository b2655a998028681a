//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits)
//!     → connection.rs (lifecycle tracking)
//!     → sniff.rs (read first request head)
//!         → upgrade request: raw socket to the upgrade dispatcher
//!         → anything else: rewind.rs replays the head into the HTTP stack
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Each connection tracked for graceful shutdown
//! - Upgrades are recognised before hyper parses the connection

pub mod connection;
pub mod listener;
pub mod rewind;
pub mod sniff;

pub use connection::{ConnectionGuard, ConnectionId, ConnectionTracker};
pub use listener::{ConnectionPermit, Listener, ListenerError};
pub use rewind::Rewind;
pub use sniff::{read_head, RequestHead, SniffError, Sniffed};
