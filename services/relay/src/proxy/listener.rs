//! TCP listener and connection dispatch.
//!
//! Accepts connections, hands each one to the handler registry under the
//! hello timeout, runs the claiming handler, and drops the connection when the
//! handler returns.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, error, info, warn, Instrument};

use super::stream::BoxedConn;
use crate::handler::HandlerRegistry;

/// Default maximum concurrent connections per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Default budget for picking a handler.
pub const DEFAULT_HELLO_TIMEOUT: Duration = Duration::from_secs(3);

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Time allowed for a handler to claim a connection.
    pub hello_timeout: Duration,
}

impl ListenerConfig {
    /// Create a new listener configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            hello_timeout: DEFAULT_HELLO_TIMEOUT,
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Total connections currently active.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections rejected due to max limit.
    pub connections_rejected: AtomicU64,
    /// Connections no handler claimed.
    pub connections_unclaimed: AtomicU64,
    /// Connections whose handler selection timed out.
    pub hello_timeouts: AtomicU64,
    /// Handlers that returned an error.
    pub handler_errors: AtomicU64,
}

/// A TCP listener for the relay.
pub struct Listener {
    /// Listener configuration.
    config: ListenerConfig,
    /// The TCP listener.
    listener: TcpListener,
    /// Handler factories, tried in order.
    registry: Arc<HandlerRegistry>,
    /// Connection semaphore for limiting concurrent connections.
    conn_semaphore: Arc<Semaphore>,
    /// Statistics.
    stats: Arc<ListenerStats>,
}

impl Listener {
    /// Create a new listener.
    pub async fn bind(config: ListenerConfig, registry: Arc<HandlerRegistry>) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            max_connections = config.max_connections,
            handlers = registry.len(),
            "Listener bound"
        );

        Ok(Self {
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            listener,
            config,
            registry,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get listener statistics.
    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Run the listener, accepting and handling connections.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "Listener started");

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let permit = match self.conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            self.stats
                                .connections_rejected
                                .fetch_add(1, Ordering::Relaxed);
                            warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                            continue;
                        }
                    };

                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .connections_active
                        .fetch_add(1, Ordering::Relaxed);

                    let listener = Arc::clone(&self);
                    let stats = Arc::clone(&self.stats);

                    tokio::spawn(
                        async move {
                            if let Err(e) = listener.handle_connection(stream, peer_addr).await {
                                debug!(
                                    peer_addr = %peer_addr,
                                    error = %format!("{e:#}"),
                                    "Connection error"
                                );
                            }

                            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                            stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                            drop(permit);
                        }
                        .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    // Brief sleep to avoid tight loop on persistent errors
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Handle a single connection.
    async fn handle_connection(&self, stream: TcpStream, peer_addr: SocketAddr) -> Result<()> {
        let local_addr = stream.local_addr()?;
        debug!(peer_addr = %peer_addr, local_addr = %local_addr, "Handling connection");
        stream.set_nodelay(true)?;

        let conn: BoxedConn = Box::new(stream);
        let dispatched = match timeout(self.config.hello_timeout, self.registry.dispatch(conn)).await
        {
            Ok(Ok(dispatched)) => dispatched,
            Ok(Err(unclaimed)) => {
                self.stats
                    .connections_unclaimed
                    .fetch_add(1, Ordering::Relaxed);
                debug!(reasons = %unclaimed, "No handler claimed the connection");
                return Ok(());
            }
            Err(_) => {
                self.stats.hello_timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(
                    timeout_ms = self.config.hello_timeout.as_millis() as u64,
                    "Handler selection timed out"
                );
                return Ok(());
            }
        };

        let description = dispatched.handler.to_string();
        debug!(factory = %dispatched.factory, handler = %description, "Connection claimed");

        if let Err(e) = dispatched.handler.handle(dispatched.conn).await {
            self.stats.handler_errors.fetch_add(1, Ordering::Relaxed);
            return Err(e.context(description));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listener_config_default() {
        let config = ListenerConfig::new("[::]:8080".parse().unwrap());
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(config.hello_timeout, DEFAULT_HELLO_TIMEOUT);
    }

    #[tokio::test]
    async fn test_listener_stats() {
        let stats = ListenerStats::default();
        stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
        assert_eq!(stats.connections_accepted.load(Ordering::Relaxed), 1);
    }
}
