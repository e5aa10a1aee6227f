//! Bidirectional byte relay for CONNECT tunnels.
//!
//! # Data Flow
//! ```text
//! a ──read──▶ [spawned task]  ──write──▶ b
//! a ◀──write── [calling task] ◀──read─── b
//! ```
//!
//! A tunnel carries opaque bytes, so the only signal that the exchange is
//! over is one side finishing. When a direction ends, a read deadline of
//! `grace` is armed on its destination, which is the source of the other
//! direction. A peer that goes quiet without closing therefore holds the
//! tunnel open for at most `grace` after the opposite side is done.
//!
//! Deadline expiry ends a direction cleanly. Genuine read/write errors are
//! reported once both directions have stopped.

use std::future;
use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::Instant;

const BUFFER_SIZE: usize = 16 * 1024;

/// Copy direction within a relay pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// From the first connection to the second (client to origin).
    AToB,
    /// From the second connection to the first (origin to client).
    BToA,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::AToB => f.write_str("a->b"),
            Direction::BToA => f.write_str("b->a"),
        }
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay {direction}: read failed: {source}")]
    Read {
        direction: Direction,
        #[source]
        source: io::Error,
    },

    #[error("relay {direction}: write failed: {source}")]
    Write {
        direction: Direction,
        #[source]
        source: io::Error,
    },

    #[error("relay task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl RelayError {
    pub fn direction(&self) -> Option<Direction> {
        match self {
            RelayError::Read { direction, .. } | RelayError::Write { direction, .. } => {
                Some(*direction)
            }
            RelayError::Task(_) => None,
        }
    }
}

/// Bytes moved in each direction by a finished relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

/// How a direction ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finish {
    Eof,
    DeadlineExceeded,
}

/// Read deadline on one direction's source, armed by the opposite direction.
struct ReadDeadline {
    rx: Option<watch::Receiver<Option<Instant>>>,
    at: Option<Instant>,
}

impl ReadDeadline {
    fn new(rx: watch::Receiver<Option<Instant>>) -> Self {
        Self { rx: Some(rx), at: None }
    }

    /// Read into `buf`, or `Ok(None)` once the deadline passes.
    async fn read<R>(&mut self, reader: &mut R, buf: &mut [u8]) -> io::Result<Option<usize>>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if let Some(rx) = self.rx.as_mut() {
                if let Some(at) = *rx.borrow_and_update() {
                    self.at = Some(at);
                }
            }

            let expiry = self.at;
            let deadline = async move {
                match expiry {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => future::pending().await,
                }
            };
            let rx = self.rx.as_mut();
            let rearmed = async move {
                match rx {
                    Some(rx) => rx.changed().await.is_ok(),
                    None => future::pending().await,
                }
            };

            let still_armable = tokio::select! {
                res = reader.read(buf) => return res.map(Some),
                () = deadline => return Ok(None),
                alive = rearmed => alive,
            };
            if !still_armable {
                // The opposite direction is gone; keep whatever deadline it left.
                self.rx = None;
            }
        }
    }
}

/// Copy `reader` into `writer` until EOF, error, or deadline expiry.
/// `total` is updated as bytes are written so the count survives errors.
async fn copy_direction<R, W>(
    direction: Direction,
    reader: &mut R,
    writer: &mut W,
    deadline: &mut ReadDeadline,
    total: &mut u64,
) -> Result<Finish, RelayError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let n = match deadline.read(reader, &mut buf).await {
            Ok(Some(0)) => return Ok(Finish::Eof),
            Ok(Some(n)) => n,
            Ok(None) => return Ok(Finish::DeadlineExceeded),
            Err(source) => return Err(RelayError::Read { direction, source }),
        };

        let written = async {
            writer.write_all(&buf[..n]).await?;
            writer.flush().await
        };
        written
            .await
            .map_err(|source| RelayError::Write { direction, source })?;
        *total += n as u64;
    }
}

/// Run one direction, then arm the grace deadline on the opposite one.
async fn run_direction<R, W>(
    direction: Direction,
    mut reader: R,
    mut writer: W,
    mut deadline: ReadDeadline,
    arm_opposite: watch::Sender<Option<Instant>>,
    grace: Duration,
) -> (u64, Result<Finish, RelayError>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0;
    let result = copy_direction(direction, &mut reader, &mut writer, &mut deadline, &mut total).await;
    arm_opposite.send_replace(Some(Instant::now() + grace));

    match &result {
        Ok(finish) => tracing::trace!(%direction, bytes = total, ?finish, "Relay direction finished"),
        Err(e) => tracing::debug!(%direction, bytes = total, error = %e, "Relay direction failed"),
    }
    (total, result)
}

/// Pipe bytes between `a` and `b` until both directions have finished.
///
/// A→B runs on a spawned task, B→A on the caller. Both connections are
/// dropped, and thereby closed, before this returns. If both directions
/// failed, the A→B error is returned.
pub async fn relay<A, B>(a: A, b: B, grace: Duration) -> Result<RelayStats, RelayError>
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    // Each sender arms the deadline on the *other* direction's source.
    let (arm_b_read, b_read_deadline) = watch::channel(None);
    let (arm_a_read, a_read_deadline) = watch::channel(None);

    let forward = tokio::spawn(run_direction(
        Direction::AToB,
        a_read,
        b_write,
        ReadDeadline::new(a_read_deadline),
        arm_b_read,
        grace,
    ));

    let (b_to_a, backward) = run_direction(
        Direction::BToA,
        b_read,
        a_write,
        ReadDeadline::new(b_read_deadline),
        arm_a_read,
        grace,
    )
    .await;

    let (a_to_b, forward) = forward.await?;

    forward?;
    backward?;
    Ok(RelayStats { a_to_b, b_to_a })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{duplex, ReadBuf};

    const GRACE: Duration = Duration::from_millis(200);

    /// A connection whose every read and write is reset.
    struct Reset;

    fn reset() -> io::Error {
        io::Error::from(io::ErrorKind::ConnectionReset)
    }

    impl AsyncRead for Reset {
        fn poll_read(self: Pin<&mut Self>, _: &mut Context<'_>, _: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Err(reset()))
        }
    }

    impl AsyncWrite for Reset {
        fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, _: &[u8]) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(reset()))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Err(reset()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Err(reset()))
        }
    }

    #[tokio::test]
    async fn bytes_flow_both_ways_unmodified() {
        let (mut client, proxy_client) = duplex(1024);
        let (proxy_origin, mut origin) = duplex(1024);

        let relay = tokio::spawn(relay(proxy_client, proxy_origin, GRACE));

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        origin.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        origin.write_all(b"\x00pong\xff").await.unwrap();
        let mut buf = [0u8; 6];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"\x00pong\xff");

        drop(client);
        drop(origin);

        let stats = relay.await.unwrap().unwrap();
        assert_eq!(stats, RelayStats { a_to_b: 4, b_to_a: 6 });
    }

    #[tokio::test]
    async fn stalled_side_released_after_grace() {
        let (mut client, proxy_client) = duplex(1024);
        let (proxy_origin, mut origin) = duplex(1024);

        let started = std::time::Instant::now();
        let relay = tokio::spawn(relay(proxy_client, proxy_origin, GRACE));

        // Client finishes its direction; the origin stays open and silent.
        client.write_all(b"bye").await.unwrap();
        client.shutdown().await.unwrap();

        let stats = tokio::time::timeout(GRACE * 10, relay)
            .await
            .expect("relay should end within the grace period")
            .unwrap()
            .unwrap();
        assert_eq!(stats.a_to_b, 3);
        assert_eq!(stats.b_to_a, 0);
        assert!(started.elapsed() >= GRACE);

        // The origin side was closed too: it sees the forwarded bytes, then EOF.
        let mut received = Vec::new();
        tokio::time::timeout(GRACE, origin.read_to_end(&mut received))
            .await
            .expect("origin connection should be closed")
            .unwrap();
        assert_eq!(received, b"bye");
    }

    #[tokio::test]
    async fn deadline_applies_to_the_other_direction() {
        let (client, proxy_client) = duplex(1024);
        let (proxy_origin, mut origin) = duplex(1024);

        let relay = tokio::spawn(relay(proxy_client, proxy_origin, GRACE));

        // Origin finishes first; the client never sends and never closes.
        origin.write_all(b"done").await.unwrap();
        origin.shutdown().await.unwrap();

        let stats = tokio::time::timeout(GRACE * 10, relay)
            .await
            .expect("relay should end within the grace period")
            .unwrap()
            .unwrap();
        assert_eq!(stats.b_to_a, 4);
        drop(client);
    }

    #[tokio::test]
    async fn write_failure_is_reported() {
        let (mut client, proxy_client) = duplex(1024);
        let (proxy_origin, origin) = duplex(1024);
        // Origin vanishes: writes towards it fail, reads from it hit EOF.
        drop(origin);

        let relay = tokio::spawn(relay(proxy_client, proxy_origin, GRACE));
        client.write_all(b"lost").await.unwrap();

        let err = tokio::time::timeout(GRACE * 10, relay)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, RelayError::Write { direction: Direction::AToB, .. }));
        assert_eq!(err.direction(), Some(Direction::AToB));
    }

    #[tokio::test]
    async fn forward_error_wins_when_both_directions_fail() {
        let err = tokio::time::timeout(GRACE * 10, relay(Reset, Reset, GRACE))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, RelayError::Read { direction: Direction::AToB, .. }));
        assert_eq!(err.direction(), Some(Direction::AToB));
    }

    #[tokio::test]
    async fn forward_error_wins_over_backward_write_failure() {
        // A reads fail; B delivers data whose write back to A fails.
        let (proxy_origin, mut origin) = duplex(1024);
        origin.write_all(b"reply").await.unwrap();

        let err = tokio::time::timeout(GRACE * 10, relay(Reset, proxy_origin, GRACE))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, RelayError::Read { direction: Direction::AToB, .. }));
    }

    #[test]
    fn direction_display() {
        assert_eq!(Direction::AToB.to_string(), "a->b");
        assert_eq!(Direction::BToA.to_string(), "b->a");
    }
}
