//! HTTP `CONNECT` tunnel handler.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use plfm_sniff::Prefixed;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tracing::info;

use super::{Claim, Handler, HandlerFactory};
use crate::error::HandlerError;
use crate::proxy::{
    relay, split_host_port, BoxedConn, RelayContext, Rewind, DEFAULT_HELLO_TIMEOUT,
};

/// Maximum size of a CONNECT request head.
const MAX_HEAD_BYTES: usize = 8192;

const MAX_HEADERS: usize = 64;

const ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Claims HTTP/1.x `CONNECT host:port` requests.
pub struct ConnectFactory {
    ctx: Arc<RelayContext>,
    reply_timeout: Duration,
}

impl ConnectFactory {
    pub fn new(ctx: Arc<RelayContext>) -> Self {
        Self {
            ctx,
            reply_timeout: DEFAULT_HELLO_TIMEOUT,
        }
    }

    /// Budget for sending the `200 Connection Established` reply.
    pub fn with_reply_timeout(mut self, reply_timeout: Duration) -> Self {
        self.reply_timeout = reply_timeout;
        self
    }
}

#[async_trait]
impl HandlerFactory for ConnectFactory {
    fn name(&self) -> &str {
        "connect"
    }

    async fn new_handler(&self, conn: &mut Rewind<BoxedConn>) -> Result<Claim, HandlerError> {
        let mut buffer = BytesMut::with_capacity(1024);

        loop {
            if !buffer.is_empty() && !buffer[0].is_ascii_uppercase() {
                return Err(HandlerError::no_handle("not an HTTP request"));
            }

            let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut request = httparse::Request::new(&mut headers);
            match request.parse(&buffer) {
                Ok(httparse::Status::Complete(head_len)) => {
                    if request.method != Some("CONNECT") {
                        return Err(HandlerError::no_handle("not a CONNECT request"));
                    }
                    let target = request.path.unwrap_or_default().to_string();
                    if let Err(e) = split_host_port(&target) {
                        return Err(HandlerError::no_handle(format!("bad CONNECT target: {e}")));
                    }
                    let early_data = buffer.split_off(head_len).freeze();
                    return Ok(Claim::consumed(ConnectHandler {
                        target,
                        early_data,
                        reply_timeout: self.reply_timeout,
                        ctx: Arc::clone(&self.ctx),
                    }));
                }
                Ok(httparse::Status::Partial) => {}
                Err(e) => return Err(HandlerError::no_handle(format!("bad request head: {e}"))),
            }

            // The method is known as soon as the request line starts
            if let Some(method) = request.method {
                if method != "CONNECT" {
                    return Err(HandlerError::no_handle("not a CONNECT request"));
                }
            }

            if buffer.len() >= MAX_HEAD_BYTES {
                return Err(HandlerError::no_handle("request head too large"));
            }

            if conn.read_buf(&mut buffer).await? == 0 {
                return Err(HandlerError::no_handle("connection closed before request head"));
            }
        }
    }
}

/// Tunnels a claimed CONNECT request to its target.
pub struct ConnectHandler {
    target: String,
    /// Bytes that arrived after the request head.
    early_data: Bytes,
    reply_timeout: Duration,
    ctx: Arc<RelayContext>,
}

impl fmt::Display for ConnectHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connect {}", self.target)
    }
}

#[async_trait]
impl Handler for ConnectHandler {
    async fn handle(self: Box<Self>, mut conn: BoxedConn) -> anyhow::Result<()> {
        timeout(self.reply_timeout, async {
            conn.write_all(ESTABLISHED).await?;
            conn.flush().await
        })
        .await
        .context("timed out sending CONNECT reply")??;

        let conn: BoxedConn = if self.early_data.is_empty() {
            conn
        } else {
            Box::new(Prefixed::new(self.early_data, conn))
        };

        let summary = relay(conn, "tcp", &self.target, &self.ctx).await?;
        info!(
            connect_target = %self.target,
            address = %summary.address,
            rewritten = summary.rewritten,
            bytes_sent = summary.sent,
            bytes_received = summary.received,
            "Tunnel closed"
        );
        Ok(())
    }
}
