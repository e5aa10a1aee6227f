//! HTTP forward proxy library.
//!
//! Accepts client connections, decodes one HTTP/1.x request head, and either
//! opens a CONNECT tunnel to the target or forwards a plain HTTP request and
//! streams the origin's response back.

pub mod config;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;

pub use config::schema::ProxyConfig;
pub use http::ProxyServer;
pub use lifecycle::Shutdown;
