//! Duplex forwarding engine.
//!
//! Copies bytes both ways between a client and an upstream connection until
//! the first direction ends. Both directions share one idle deadline that is
//! renewed before every read, so a session only times out after it has been
//! idle as a whole for the configured duration; it is not a lifetime cap.

use std::fmt;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{sleep_until, Instant};

use crate::error::ForwardError;

/// Read buffer size per direction.
pub const FORWARD_BUF_SIZE: usize = 32 * 1024;

/// Default idle timeout for a forwarding session.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Direction of a forwarding half.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to upstream (counted as sent).
    ClientToUpstream,
    /// Upstream to client (counted as received).
    UpstreamToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientToUpstream => f.write_str("client->upstream"),
            Self::UpstreamToClient => f.write_str("upstream->client"),
        }
    }
}

/// Clean end of a forwarding session: `direction` reached end-of-stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardEnd {
    pub direction: Direction,
}

/// Per-session byte counters.
///
/// Each field is written by one direction only; both may be read at any time.
#[derive(Debug, Default)]
pub struct ForwardCounters {
    sent: AtomicU64,
    received: AtomicU64,
}

impl ForwardCounters {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes written to the upstream.
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Bytes written to the client.
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    fn counter(&self, direction: Direction) -> &AtomicU64 {
        match direction {
            Direction::ClientToUpstream => &self.sent,
            Direction::UpstreamToClient => &self.received,
        }
    }
}

/// Idle deadline shared by both directions of a session.
struct IdleClock {
    start: Instant,
    /// Milliseconds since `start` of the last renewal.
    last_activity: AtomicU64,
    idle_timeout: Duration,
}

impl IdleClock {
    fn new(idle_timeout: Duration) -> Self {
        Self {
            start: Instant::now(),
            last_activity: AtomicU64::new(0),
            idle_timeout,
        }
    }

    /// Push the deadline to `now + idle_timeout`.
    fn renew(&self) {
        let elapsed = self.start.elapsed().as_millis() as u64;
        self.last_activity.fetch_max(elapsed, Ordering::AcqRel);
    }

    fn deadline(&self) -> Instant {
        let last = Duration::from_millis(self.last_activity.load(Ordering::Acquire));
        self.start + last + self.idle_timeout
    }

    /// Run `op` until it completes or the shared deadline passes without
    /// being renewed by the other direction.
    async fn bound<T, F>(&self, op: F) -> io::Result<T>
    where
        F: Future<Output = io::Result<T>>,
    {
        tokio::pin!(op);
        loop {
            let deadline = self.deadline();
            tokio::select! {
                result = &mut op => return result,
                _ = sleep_until(deadline) => {
                    if self.deadline() <= Instant::now() {
                        return Err(io::Error::new(io::ErrorKind::TimedOut, "idle timeout"));
                    }
                }
            }
        }
    }
}

/// Forward bytes between `client` and `upstream` until one direction ends.
///
/// Returns the first terminal event: `Ok` when a side reached end-of-stream,
/// `Err` on a read/write failure or idle timeout. The other direction is
/// dropped at that point. Neither connection is closed here; the caller
/// drops them and can still read `counters`.
pub async fn forward<C, U>(
    client: &mut C,
    upstream: &mut U,
    idle_timeout: Duration,
    counters: &ForwardCounters,
) -> Result<ForwardEnd, ForwardError>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let clock = IdleClock::new(idle_timeout);
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let to_upstream = copy_half(
        &mut client_read,
        &mut upstream_write,
        Direction::ClientToUpstream,
        &clock,
        counters,
    );
    let to_client = copy_half(
        &mut upstream_read,
        &mut client_write,
        Direction::UpstreamToClient,
        &clock,
        counters,
    );

    tokio::select! {
        result = to_upstream => result,
        result = to_client => result,
    }
}

async fn copy_half<R, W>(
    reader: &mut R,
    writer: &mut W,
    direction: Direction,
    clock: &IdleClock,
    counters: &ForwardCounters,
) -> Result<ForwardEnd, ForwardError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    // Not copy_bidirectional: the deadline has to be renewed on every pass
    let mut buf = vec![0u8; FORWARD_BUF_SIZE];
    let counter = counters.counter(direction);

    loop {
        clock.renew();

        let n = clock
            .bound(reader.read(&mut buf))
            .await
            .map_err(|source| ForwardError::Read { direction, source })?;
        if n == 0 {
            return Ok(ForwardEnd { direction });
        }

        clock
            .bound(async {
                writer.write_all(&buf[..n]).await?;
                writer.flush().await
            })
            .await
            .map_err(|source| ForwardError::Write { direction, source })?;

        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}
