//! Outbound connections to origin servers.

use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;

/// Failure to reach an origin. The cause is passed through unclassified.
#[derive(Debug, Error)]
#[error("dial {host}:{port}: {source}")]
pub struct DialError {
    pub host: String,
    pub port: u16,
    #[source]
    pub source: io::Error,
}

/// Opens TCP connections to origins within a fixed time bound. No retries.
#[derive(Debug, Clone, Copy)]
pub struct OriginDialer {
    timeout: Duration,
}

impl OriginDialer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Resolve and connect to `host:port`.
    ///
    /// The timeout covers name resolution and the TCP handshake together and
    /// surfaces as `io::ErrorKind::TimedOut`.
    pub async fn dial(&self, host: &str, port: u16) -> Result<TcpStream, DialError> {
        let attempt = tokio::time::timeout(self.timeout, TcpStream::connect((host, port))).await;

        let stream = match attempt {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(DialError {
                    host: host.to_string(),
                    port,
                    source,
                })
            }
            Err(_) => {
                return Err(DialError {
                    host: host.to_string(),
                    port,
                    source: io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("connect timed out after {:?}", self.timeout),
                    ),
                })
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "Failed to set TCP_NODELAY on origin stream");
        }

        tracing::debug!(host, port, "Origin connected");
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn dials_listening_origin() {
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = origin.local_addr().unwrap().port();

        let dialer = OriginDialer::new(Duration::from_secs(1));
        let stream = dialer.dial("127.0.0.1", port).await.unwrap();
        assert_eq!(stream.peer_addr().unwrap().port(), port);
    }

    #[tokio::test]
    async fn refused_connection_carries_cause() {
        // Bind then drop to find a port nobody listens on.
        let port = {
            let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
            origin.local_addr().unwrap().port()
        };

        let dialer = OriginDialer::new(Duration::from_secs(1));
        let err = dialer.dial("127.0.0.1", port).await.unwrap_err();
        assert_eq!(err.host, "127.0.0.1");
        assert_eq!(err.port, port);
        assert_eq!(err.source.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn dials_ipv6_literal_without_brackets() {
        let Ok(origin) = TcpListener::bind("[::1]:0").await else {
            // No IPv6 loopback on this host.
            return;
        };
        let port = origin.local_addr().unwrap().port();

        let dialer = OriginDialer::new(Duration::from_secs(1));
        assert!(dialer.dial("::1", port).await.is_ok());
    }
}
