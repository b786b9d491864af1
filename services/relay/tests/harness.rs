//! Test harness for relay integration tests.
//!
//! Provides helpers to spawn TCP echo backends and relay listeners on
//! loopback.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

use plfm_relay::{
    ConnectFactory, FixedTargetFactory, HandlerRegistry, Listener, ListenerConfig, PortTable,
    PreDetector, RelayContext, Timeouts,
};

#[derive(Default)]
struct EchoStats {
    connections: AtomicU64,
    bytes_received: AtomicU64,
}

/// Loopback TCP server that echoes every byte back until the peer closes.
pub struct TcpEchoBackend {
    pub addr: SocketAddr,
    stats: Arc<EchoStats>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TcpEchoBackend {
    pub async fn spawn() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let stats = Arc::new(EchoStats::default());
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let accept_stats = Arc::clone(&stats);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => {
                            accept_stats.connections.fetch_add(1, Ordering::Relaxed);
                            tokio::spawn(echo(stream, Arc::clone(&accept_stats)));
                        }
                        Err(_) => break,
                    },
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            stats,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn connection_count(&self) -> u64 {
        self.stats.connections.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.stats.bytes_received.load(Ordering::Relaxed)
    }
}

async fn echo(mut stream: TcpStream, stats: Arc<EchoStats>) {
    let mut buf = vec![0u8; 8192];
    while let Ok(n) = stream.read(&mut buf).await {
        if n == 0 {
            break;
        }
        stats.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
        if stream.write_all(&buf[..n]).await.is_err() {
            break;
        }
    }
}

impl Drop for TcpEchoBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

pub struct RelayHandle {
    pub listen_addr: SocketAddr,
    pub ctx: Arc<RelayContext>,
    pub listener: Arc<Listener>,
}

impl RelayHandle {
    /// Relay acting as an HTTP CONNECT proxy.
    pub async fn connect_proxy(ports: PortTable) -> io::Result<Self> {
        Self::spawn(None, ports, Timeouts::default()).await
    }

    /// Relay forwarding every connection to `upstream`.
    pub async fn fixed(upstream: &str, ports: PortTable) -> io::Result<Self> {
        Self::spawn(Some(upstream), ports, Timeouts::default()).await
    }

    pub async fn spawn(
        upstream: Option<&str>,
        ports: PortTable,
        timeouts: Timeouts,
    ) -> io::Result<Self> {
        let ctx = Arc::new(
            RelayContext::new(Arc::new(PreDetector::with_ports(ports))).with_timeouts(timeouts),
        );

        let mut registry = HandlerRegistry::new();
        match upstream {
            Some(upstream) => {
                registry.register(FixedTargetFactory::new(upstream, Arc::clone(&ctx)));
            }
            None => {
                registry.register(ConnectFactory::new(Arc::clone(&ctx)));
            }
        }

        let mut config = ListenerConfig::new("127.0.0.1:0".parse().unwrap());
        config.hello_timeout = Duration::from_secs(1);
        let listener = Arc::new(Listener::bind(config, Arc::new(registry)).await?);
        let listen_addr = listener.local_addr()?;

        let running = Arc::clone(&listener);
        tokio::spawn(async move {
            let _ = running.run().await;
        });

        tokio::time::sleep(Duration::from_millis(10)).await;

        Ok(Self {
            listen_addr,
            ctx,
            listener,
        })
    }
}

/// Port table sniffing `http` for HTTP and `https` for TLS.
pub fn ports(http: &[u16], https: &[u16]) -> PortTable {
    PortTable::new(http.iter().copied(), https.iter().copied())
}
