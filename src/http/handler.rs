//! Per-connection protocol dispatch.
//!
//! # Data Flow
//! ```text
//! client stream
//!     → decode request head (handshake deadline)
//!     → CONNECT: dial → "200 Connection established" → relay
//!     → other:   dial → head + body to origin → origin response to client
//! ```
//!
//! The handler owns the client stream and the origin stream it dials. Both
//! are dropped, and so closed, on every exit path, origin first. Nothing is
//! written to the client when decoding or dialing fails, except for the
//! optional 502 on the plain HTTP path.

use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::config::ProxyConfig;
use crate::http::body::forward_body;
use crate::http::request::{DecodeError, ParsedRequest, RequestDecoder};
use crate::http::response;
use crate::net::dialer::{DialError, OriginDialer};
use crate::net::relay::{relay, RelayError};
use crate::observability::metrics;

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Dial(#[from] DialError),

    #[error("write to client: {0}")]
    ClientWrite(#[source] io::Error),

    #[error("write to origin: {0}")]
    OriginWrite(#[source] io::Error),

    #[error("forward request body: {0}")]
    Body(#[source] io::Error),

    #[error("copy response: {0}")]
    Response(#[source] io::Error),

    #[error(transparent)]
    Relay(#[from] RelayError),
}

/// Serves one accepted client connection. Cheap to clone; the server keeps
/// one template and clones it per connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandler {
    decoder: RequestDecoder,
    dialer: OriginDialer,
    handshake_timeout: Duration,
    relay_grace: Duration,
    bad_gateway_on_dial_failure: bool,
}

impl ConnectionHandler {
    pub fn new(config: &ProxyConfig) -> Self {
        Self {
            decoder: RequestDecoder::new(config.forwarding.max_header_bytes),
            dialer: OriginDialer::new(config.timeouts.connect()),
            handshake_timeout: config.timeouts.handshake(),
            relay_grace: config.timeouts.relay_grace(),
            bad_gateway_on_dial_failure: config.forwarding.bad_gateway_on_dial_failure,
        }
    }

    /// Serve `stream` to completion. Errors are logged, never returned.
    pub async fn handle(self, stream: TcpStream) {
        match self.serve(stream).await {
            Ok(()) => tracing::debug!("Connection finished"),
            Err(HandlerError::Decode(DecodeError::ConnectionClosed)) => {
                tracing::debug!("Client closed before sending a request")
            }
            Err(e @ HandlerError::Decode(_)) => {
                metrics::record_decode_failure();
                tracing::warn!(error = %e, "Failed to read request");
            }
            Err(e @ HandlerError::Dial(_)) => tracing::warn!(error = %e, "Failed to reach origin"),
            Err(e) => tracing::info!(error = %e, "Connection ended with error"),
        }
    }

    async fn serve(&self, stream: TcpStream) -> Result<(), HandlerError> {
        let mut client = BufReader::new(stream);

        let request = tokio::time::timeout(self.handshake_timeout, self.decoder.decode(&mut client))
            .await
            .map_err(|_| DecodeError::HandshakeTimeout(self.handshake_timeout))??;

        tracing::debug!(
            method = %request.method,
            target = %request.target,
            host = %request.host,
            port = request.port,
            version = %request.version,
            "Request decoded"
        );

        if request.is_connect() {
            metrics::record_request("connect");
            self.tunnel(client, request).await
        } else {
            metrics::record_request("http");
            self.forward(client, request).await
        }
    }

    /// CONNECT: confirm the tunnel, then relay opaque bytes both ways.
    async fn tunnel(&self, mut client: BufReader<TcpStream>, request: ParsedRequest) -> Result<(), HandlerError> {
        let mut origin = match self.dialer.dial(&request.host, request.port).await {
            Ok(origin) => origin,
            Err(e) => {
                metrics::record_dial_failure("connect");
                return Err(e.into());
            }
        };

        client
            .write_all(response::connection_established(&request.version).as_bytes())
            .await
            .map_err(HandlerError::ClientWrite)?;

        // Bytes the client sent right behind the head (e.g. a TLS ClientHello)
        // are already buffered and would be lost with the reader.
        let early = client.buffer().to_vec();
        if !early.is_empty() {
            origin.write_all(&early).await.map_err(HandlerError::OriginWrite)?;
        }

        tracing::debug!(host = %request.host, port = request.port, "Tunnel established");
        let stats = relay(client.into_inner(), origin, self.relay_grace).await?;
        metrics::record_relay(&stats);
        tracing::debug!(
            upstream_bytes = stats.a_to_b + early.len() as u64,
            downstream_bytes = stats.b_to_a,
            "Tunnel closed"
        );
        Ok(())
    }

    /// Plain HTTP: send the request as received, stream the response back once.
    async fn forward(&self, mut client: BufReader<TcpStream>, request: ParsedRequest) -> Result<(), HandlerError> {
        let mut origin = match self.dialer.dial(&request.host, request.port).await {
            Ok(origin) => origin,
            Err(e) => {
                metrics::record_dial_failure("http");
                if self.bad_gateway_on_dial_failure {
                    if let Err(write_err) = client
                        .write_all(response::bad_gateway(&request.version).as_bytes())
                        .await
                    {
                        tracing::debug!(error = %write_err, "Failed to send 502 to client");
                    }
                }
                return Err(e.into());
            }
        };

        origin
            .write_all(&request.head)
            .await
            .map_err(HandlerError::OriginWrite)?;
        forward_body(request.framing, &mut client, &mut origin)
            .await
            .map_err(HandlerError::Body)?;
        origin.flush().await.map_err(HandlerError::OriginWrite)?;

        let copied = tokio::io::copy(&mut origin, &mut client)
            .await
            .map_err(HandlerError::Response)?;
        client.flush().await.map_err(HandlerError::ClientWrite)?;

        tracing::debug!(response_bytes = copied, "Response forwarded");
        Ok(())
    }
}
