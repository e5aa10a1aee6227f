//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Connection handlers produce:
//!     → logging.rs (structured log events, one span per connection)
//!     → metrics.rs (counters, gauges)
//!
//! Consumers:
//!     → stdout (pretty or JSON)
//!     → Metrics endpoint (Prometheus scrape, optional)
//! ```
//!
//! # Design Decisions
//! - Connection ID flows through every event of a connection via its span
//! - Metrics are cheap (atomic increments) and off by default

pub mod logging;
pub mod metrics;
