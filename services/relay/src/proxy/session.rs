//! Proxy-style session: pre-detect, peek, connect, forward.
//!
//! Handlers that end up with a destination address call [`relay`] to finish
//! the session. Peek failures degrade to the original address; connect and
//! forwarding failures are the session's result and are not retried.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use plfm_sniff::Sniffer;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::detect::{PreDetector, PreProtocol};
use super::forward::{forward, ForwardCounters, ForwardEnd, DEFAULT_IDLE_TIMEOUT};
use super::peek::peek_with;
use super::stream::BoxedConn;

/// Default connect timeout for upstream connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Timeouts applied by a session.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// Budget for connecting to the upstream.
    pub connect: Duration,
    /// Idle timeout while forwarding.
    pub idle: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: DEFAULT_CONNECT_TIMEOUT,
            idle: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// Statistics shared by all sessions.
#[derive(Debug, Default)]
pub struct RelayStats {
    /// Sessions started.
    pub sessions_started: AtomicU64,
    /// Sessions that ended on a clean end-of-stream.
    pub sessions_completed: AtomicU64,
    /// Sessions that ended on an I/O error or idle timeout.
    pub sessions_failed: AtomicU64,
    /// Destinations eligible for peeking.
    pub peek_attempted: AtomicU64,
    /// Destinations rewritten from a sniffed hostname.
    pub peek_rewritten: AtomicU64,
    /// Peeks that fell back to the original destination.
    pub peek_failed: AtomicU64,
    /// Upstream connection failures.
    pub connect_failed: AtomicU64,
    /// Bytes forwarded to upstreams.
    pub bytes_sent: AtomicU64,
    /// Bytes forwarded to clients.
    pub bytes_received: AtomicU64,
}

/// Everything a session needs besides the connection itself.
#[derive(Debug)]
pub struct RelayContext {
    pub detector: Arc<PreDetector>,
    pub sniffer: Sniffer,
    pub timeouts: Timeouts,
    pub stats: Arc<RelayStats>,
}

impl RelayContext {
    /// Create a context with default sniffer and timeouts.
    pub fn new(detector: Arc<PreDetector>) -> Self {
        Self {
            detector,
            sniffer: Sniffer::new(),
            timeouts: Timeouts::default(),
            stats: Arc::new(RelayStats::default()),
        }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_sniffer(mut self, sniffer: Sniffer) -> Self {
        self.sniffer = sniffer;
        self
    }
}

/// Result of a finished session.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    /// Address that was connected to.
    pub address: String,
    /// Whether `address` came from a sniffed hostname.
    pub rewritten: bool,
    /// Bytes forwarded to the upstream.
    pub sent: u64,
    /// Bytes forwarded to the client.
    pub received: u64,
    /// Which side ended the session.
    pub end: ForwardEnd,
}

/// Relay `conn` to `address` over `network`.
///
/// The connection is dropped (closed) when this returns.
pub async fn relay(
    conn: BoxedConn,
    network: &str,
    address: &str,
    ctx: &RelayContext,
) -> Result<SessionSummary> {
    let stats = &ctx.stats;
    stats.sessions_started.fetch_add(1, Ordering::Relaxed);

    let (mut conn, address, rewritten) = match ctx.detector.classify(network, address) {
        PreProtocol::Unknown => (conn, address.to_string(), false),
        protocol => {
            stats.peek_attempted.fetch_add(1, Ordering::Relaxed);
            // Always continue with the returned connection: it holds the sniffed bytes
            let peeked = peek_with(&ctx.sniffer, conn, address, protocol).await;
            if peeked.ok {
                stats.peek_rewritten.fetch_add(1, Ordering::Relaxed);
            } else {
                stats.peek_failed.fetch_add(1, Ordering::Relaxed);
            }
            (peeked.conn, peeked.address, peeked.ok)
        }
    };

    let mut upstream = match connect(&address, ctx.timeouts.connect).await {
        Ok(stream) => stream,
        Err(e) => {
            stats.connect_failed.fetch_add(1, Ordering::Relaxed);
            warn!(address = %address, error = %e, "Upstream connection failed");
            return Err(e).with_context(|| format!("failed to connect to {address}"));
        }
    };

    debug!(address = %address, rewritten, "Connected to upstream");

    let counters = ForwardCounters::new();
    let result = forward(&mut conn, &mut upstream, ctx.timeouts.idle, &counters).await;

    let (sent, received) = (counters.sent(), counters.received());
    stats.bytes_sent.fetch_add(sent, Ordering::Relaxed);
    stats.bytes_received.fetch_add(received, Ordering::Relaxed);

    match result {
        Ok(end) => {
            stats.sessions_completed.fetch_add(1, Ordering::Relaxed);
            debug!(
                address = %address,
                bytes_sent = sent,
                bytes_received = received,
                closed_by = %end.direction,
                "Session closed"
            );
            Ok(SessionSummary {
                address,
                rewritten,
                sent,
                received,
                end,
            })
        }
        Err(e) => {
            stats.sessions_failed.fetch_add(1, Ordering::Relaxed);
            debug!(
                address = %address,
                bytes_sent = sent,
                bytes_received = received,
                error = %e,
                "Session failed"
            );
            Err(e).with_context(|| format!("relay to {address}"))
        }
    }
}

/// Connect to a `host:port` upstream within `connect_timeout`.
async fn connect(address: &str, connect_timeout: Duration) -> io::Result<TcpStream> {
    let stream = match timeout(connect_timeout, TcpStream::connect(address)).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "connect timeout",
            ))
        }
    };
    stream.set_nodelay(true)?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use plfm_testing::http::get_request;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use crate::proxy::detect::PortTable;

    async fn echo_once(listener: TcpListener) {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stream.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn test_relay_rewrites_and_forwards() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(echo_once(listener));

        let detector = Arc::new(PreDetector::with_ports(PortTable::new([port], [])));
        let ctx = RelayContext::new(detector);

        let request = get_request(&format!("localhost:{port}"), "/");
        let (mut client, conn) = tokio::io::duplex(4096);
        client.write_all(&request).await.unwrap();

        let client_side = async {
            let mut echoed = vec![0u8; request.len()];
            client.read_exact(&mut echoed).await.unwrap();
            drop(client);
            echoed
        };

        let address = format!("127.0.0.1:{port}");
        let (summary, echoed) = tokio::join!(
            relay(Box::new(conn), "tcp", &address, &ctx),
            client_side
        );

        let summary = summary.unwrap();
        assert_eq!(echoed, request);
        assert!(summary.rewritten);
        assert_eq!(summary.address, format!("localhost:{port}"));
        assert_eq!(summary.sent, request.len() as u64);
        assert_eq!(ctx.stats.peek_rewritten.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_relay_hostname_destination_skips_peek() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(echo_once(listener));

        // The port is sniffable, but only literal IPs are peeked
        let detector = Arc::new(PreDetector::with_ports(PortTable::new([port], [])));
        let ctx = RelayContext::new(detector);

        let (mut client, conn) = tokio::io::duplex(4096);
        client.write_all(b"hello").await.unwrap();

        let client_side = async {
            let mut echoed = vec![0u8; 5];
            client.read_exact(&mut echoed).await.unwrap();
            drop(client);
            echoed
        };

        let address = format!("localhost:{port}");
        let (summary, echoed) = tokio::join!(
            relay(Box::new(conn), "tcp", &address, &ctx),
            client_side
        );

        let summary = summary.unwrap();
        assert_eq!(echoed, b"hello");
        assert!(!summary.rewritten);
        assert_eq!(summary.address, address);
        assert_eq!(summary.sent, 5);
        assert_eq!(ctx.stats.peek_attempted.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_relay_connect_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = listener.local_addr().unwrap();
        drop(listener);

        let ctx = RelayContext::new(Arc::new(PreDetector::new()));
        let (_client, conn) = tokio::io::duplex(64);

        let result = relay(Box::new(conn), "tcp", &dead_addr.to_string(), &ctx).await;
        assert!(result.is_err());
        assert_eq!(ctx.stats.connect_failed.load(Ordering::Relaxed), 1);
        assert_eq!(ctx.stats.peek_attempted.load(Ordering::Relaxed), 0);
    }
}
