//! Relay core.
//!
//! This module provides:
//! - Protocol pre-detection for literal-IP destinations
//! - Non-destructive peeking to recover a hostname (HTTP Host, TLS SNI)
//! - The duplex forwarding engine with idle timeout and byte counters
//! - The proxy session that ties them together
//! - TCP listener management
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> HandlerRegistry -> Handler -> relay()
//!                                                       |
//!                                 classify -> peek -> connect -> forward
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let ctx = Arc::new(RelayContext::new(Arc::new(PreDetector::new())));
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register(ConnectFactory::new(Arc::clone(&ctx)));
//!
//! let config = ListenerConfig::new("[::]:8080".parse()?);
//! let listener = Arc::new(Listener::bind(config, Arc::new(registry)).await?);
//! listener.run().await?;
//! ```

mod address;
mod detect;
mod forward;
mod listener;
mod peek;
mod session;
mod stream;

pub use address::{join_host_port, split_host_port};
pub use detect::{PortTable, PreDetector, PreProtocol, DEFAULT_HTTPS_PORTS, DEFAULT_HTTP_PORTS};
pub use forward::{
    forward, Direction, ForwardCounters, ForwardEnd, DEFAULT_IDLE_TIMEOUT, FORWARD_BUF_SIZE,
};
pub use listener::{
    Listener, ListenerConfig, ListenerStats, DEFAULT_HELLO_TIMEOUT, DEFAULT_MAX_CONNECTIONS,
};
pub use peek::{peek, peek_with, Peeked};
pub use session::{
    relay, RelayContext, RelayStats, SessionSummary, Timeouts, DEFAULT_CONNECT_TIMEOUT,
};
pub use stream::{BoxedConn, Connection, Rewind};
