//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept, connection limits)
//!     → connection.rs (connection ID, in-flight tracking)
//!     → Hand off to HTTP layer
//!
//! Outgoing:
//!     dialer.rs (bounded connect to origin)
//!     relay.rs (CONNECT tunnel byte pump with grace deadline)
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Each connection tracked so shutdown can drain in-flight work
//! - Origins are dialed fresh per request; nothing is pooled

pub mod connection;
pub mod dialer;
pub mod listener;
pub mod relay;
