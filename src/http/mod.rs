//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! accepted TCP connection
//!     → server.rs (accept loop, one task per connection)
//!     → handler.rs (handshake deadline, dispatch on method)
//!     → request.rs (decode head, resolve origin, body framing)
//!     → CONNECT: response.rs status line → net::relay
//!     → other:   body.rs verbatim body → origin response copied back
//! ```

pub mod body;
pub mod handler;
pub mod request;
pub mod response;
pub mod server;

pub use handler::{ConnectionHandler, HandlerError};
pub use request::{BodyFraming, DecodeError, ParsedRequest, RequestDecoder};
pub use server::{ProxyServer, ServerError};
