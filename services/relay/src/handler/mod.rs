//! Protocol handlers.
//!
//! A [`HandlerFactory`] inspects the start of a new connection and either
//! claims it by producing a [`Handler`] or declines with
//! [`HandlerError::NoHandle`]. The [`HandlerRegistry`] tries factories in
//! registration order and owns rollback: every factory sees the connection
//! from its first byte, and a declined connection loses nothing.

mod connect;
mod fixed;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::HandlerError;
use crate::proxy::{BoxedConn, Rewind};

pub use connect::{ConnectFactory, ConnectHandler};
pub use fixed::{FixedTargetFactory, FixedTargetHandler};

/// A claimed connection's protocol driver.
#[async_trait]
pub trait Handler: fmt::Display + Send {
    /// Drive the connection until the session ends.
    ///
    /// Runs once. The connection is dropped when this returns, whatever the
    /// result.
    async fn handle(self: Box<Self>, conn: BoxedConn) -> anyhow::Result<()>;
}

/// Tries to recognize a protocol at the start of a connection.
///
/// Factories only get read access to the connection; they cannot write to it
/// or close it.
#[async_trait]
pub trait HandlerFactory: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Read as much of `conn` as needed to decide whether to claim it.
    async fn new_handler(&self, conn: &mut Rewind<BoxedConn>) -> Result<Claim, HandlerError>;
}

/// A factory's successful match.
pub struct Claim {
    /// The handler that will drive the connection.
    pub handler: Box<dyn Handler>,
    /// Whether the handler must see the stream from its first byte.
    pub replay: bool,
}

impl Claim {
    /// Claim the connection and replay everything the factory read.
    pub fn replay(handler: impl Handler + 'static) -> Self {
        Self {
            handler: Box::new(handler),
            replay: true,
        }
    }

    /// Claim the connection; the bytes the factory read are consumed.
    pub fn consumed(handler: impl Handler + 'static) -> Self {
        Self {
            handler: Box::new(handler),
            replay: false,
        }
    }
}

/// A connection claimed by a handler.
pub struct Dispatched {
    pub handler: Box<dyn Handler>,
    /// Stream positioned according to the claim's replay flag.
    pub conn: BoxedConn,
    /// Name of the claiming factory.
    pub factory: String,
}

impl fmt::Debug for Dispatched {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatched")
            .field("handler", &self.handler.to_string())
            .field("factory", &self.factory)
            .finish_non_exhaustive()
    }
}

/// A connection no factory claimed.
pub struct Unclaimed {
    /// The connection, replaying every byte read while matching.
    pub conn: BoxedConn,
    /// Why each factory declined, in order.
    pub reasons: Vec<String>,
}

impl fmt::Debug for Unclaimed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unclaimed")
            .field("reasons", &self.reasons)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Unclaimed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reasons.is_empty() {
            return f.write_str("no handlers registered");
        }
        f.write_str(&self.reasons.join("; "))
    }
}

/// Ordered set of handler factories.
#[derive(Default)]
pub struct HandlerRegistry {
    factories: Vec<Arc<dyn HandlerFactory>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a factory; earlier factories are tried first.
    pub fn register(&mut self, factory: impl HandlerFactory + 'static) -> &mut Self {
        self.factories.push(Arc::new(factory));
        self
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Find a handler for `conn`.
    ///
    /// Any factory error, including I/O errors while matching, rolls the
    /// connection back and moves on to the next factory.
    pub async fn dispatch(&self, conn: BoxedConn) -> Result<Dispatched, Unclaimed> {
        let mut conn = Rewind::new(conn);
        let mut reasons = Vec::with_capacity(self.factories.len());

        for factory in &self.factories {
            conn.rewind();
            match factory.new_handler(&mut conn).await {
                Ok(claim) => {
                    debug!(
                        factory = factory.name(),
                        consumed = conn.consumed(),
                        replay = claim.replay,
                        "Connection claimed"
                    );
                    return Ok(Dispatched {
                        handler: claim.handler,
                        conn: Box::new(conn.into_prefixed(claim.replay)),
                        factory: factory.name().to_string(),
                    });
                }
                Err(e) => {
                    debug!(factory = factory.name(), error = %e, "Factory declined");
                    reasons.push(format!("{}: {e}", factory.name()));
                }
            }
        }

        Err(Unclaimed {
            conn: Box::new(conn.into_prefixed(true)),
            reasons,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct Noop(&'static str);

    impl fmt::Display for Noop {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.0)
        }
    }

    #[async_trait]
    impl Handler for Noop {
        async fn handle(self: Box<Self>, _conn: BoxedConn) -> anyhow::Result<()> {
            Ok(())
        }
    }

    /// Claims connections starting with `magic`, reading exactly its length.
    struct Magic {
        magic: &'static [u8],
        replay: bool,
    }

    #[async_trait]
    impl HandlerFactory for Magic {
        fn name(&self) -> &str {
            "magic"
        }

        async fn new_handler(&self, conn: &mut Rewind<BoxedConn>) -> Result<Claim, HandlerError> {
            let mut buf = vec![0u8; self.magic.len()];
            conn.read_exact(&mut buf).await?;
            if buf != self.magic {
                return Err(HandlerError::no_handle("bad magic"));
            }
            let handler = Noop("magic");
            Ok(if self.replay {
                Claim::replay(handler)
            } else {
                Claim::consumed(handler)
            })
        }
    }

    /// Reads `n` bytes and always declines.
    struct Greedy(usize);

    #[async_trait]
    impl HandlerFactory for Greedy {
        fn name(&self) -> &str {
            "greedy"
        }

        async fn new_handler(&self, conn: &mut Rewind<BoxedConn>) -> Result<Claim, HandlerError> {
            let mut buf = vec![0u8; self.0];
            conn.read_exact(&mut buf).await?;
            Err(HandlerError::no_handle("never matches"))
        }
    }

    async fn conn_with(data: &[u8]) -> (tokio::io::DuplexStream, BoxedConn) {
        let (mut remote, local) = tokio::io::duplex(1024);
        remote.write_all(data).await.unwrap();
        (remote, Box::new(local))
    }

    async fn read_n(conn: &mut BoxedConn, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        conn.read_exact(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn test_each_factory_sees_stream_from_start() {
        let mut registry = HandlerRegistry::new();
        registry.register(Greedy(6)).register(Magic {
            magic: b"MAGIC",
            replay: true,
        });

        let (_remote, conn) = conn_with(b"MAGIC payload").await;
        let mut dispatched = registry.dispatch(conn).await.unwrap();
        assert_eq!(dispatched.factory, "magic");
        assert_eq!(dispatched.handler.to_string(), "magic");
        assert_eq!(read_n(&mut dispatched.conn, 13).await, b"MAGIC payload");
    }

    #[tokio::test]
    async fn test_consumed_claim_drops_matched_bytes() {
        let mut registry = HandlerRegistry::new();
        registry.register(Magic {
            magic: b"MAGIC",
            replay: false,
        });

        let (_remote, conn) = conn_with(b"MAGIC payload").await;
        let mut dispatched = registry.dispatch(conn).await.unwrap();
        assert_eq!(read_n(&mut dispatched.conn, 8).await, b" payload");
    }

    #[tokio::test]
    async fn test_consumed_claim_keeps_bytes_read_by_earlier_factories() {
        let mut registry = HandlerRegistry::new();
        registry.register(Greedy(9)).register(Magic {
            magic: b"MAGIC",
            replay: false,
        });

        let (mut remote, conn) = conn_with(b"MAGIC pay").await;
        let mut dispatched = registry.dispatch(conn).await.unwrap();
        remote.write_all(b"load").await.unwrap();
        assert_eq!(read_n(&mut dispatched.conn, 8).await, b" payload");
    }

    #[tokio::test]
    async fn test_unclaimed_connection_keeps_every_byte() {
        let mut registry = HandlerRegistry::new();
        registry.register(Greedy(4)).register(Magic {
            magic: b"MAGIC",
            replay: true,
        });

        let (_remote, conn) = conn_with(b"other data").await;
        let mut unclaimed = registry.dispatch(conn).await.unwrap_err();
        assert_eq!(unclaimed.reasons.len(), 2);
        assert!(unclaimed.reasons[0].starts_with("greedy"));
        assert!(unclaimed.reasons[1].contains("bad magic"));
        assert_eq!(read_n(&mut unclaimed.conn, 10).await, b"other data");
    }

    #[tokio::test]
    async fn test_io_error_while_matching_moves_on() {
        let mut registry = HandlerRegistry::new();
        registry.register(Greedy(64)).register(Magic {
            magic: b"AB",
            replay: true,
        });

        // EOF before the greedy factory is satisfied
        let (remote, conn) = conn_with(b"ABCD").await;
        drop(remote);
        let mut dispatched = registry.dispatch(conn).await.unwrap();
        assert_eq!(dispatched.factory, "magic");
        assert_eq!(read_n(&mut dispatched.conn, 4).await, b"ABCD");
    }

    #[tokio::test]
    async fn test_empty_registry() {
        let registry = HandlerRegistry::new();
        assert!(registry.is_empty());

        let (_remote, conn) = conn_with(b"x").await;
        let unclaimed = registry.dispatch(conn).await.unwrap_err();
        assert_eq!(unclaimed.to_string(), "no handlers registered");
    }
}
