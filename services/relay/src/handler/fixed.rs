//! Fixed-destination handler for port forwarding and transparent redirects.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::{Claim, Handler, HandlerFactory};
use crate::error::HandlerError;
use crate::proxy::{relay, BoxedConn, RelayContext, Rewind};

/// Claims every connection without reading and relays it to one address.
pub struct FixedTargetFactory {
    target: String,
    ctx: Arc<RelayContext>,
}

impl FixedTargetFactory {
    pub fn new(target: impl Into<String>, ctx: Arc<RelayContext>) -> Self {
        Self {
            target: target.into(),
            ctx,
        }
    }
}

#[async_trait]
impl HandlerFactory for FixedTargetFactory {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn new_handler(&self, _conn: &mut Rewind<BoxedConn>) -> Result<Claim, HandlerError> {
        Ok(Claim::replay(FixedTargetHandler {
            target: self.target.clone(),
            ctx: Arc::clone(&self.ctx),
        }))
    }
}

pub struct FixedTargetHandler {
    target: String,
    ctx: Arc<RelayContext>,
}

impl fmt::Display for FixedTargetHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fixed {}", self.target)
    }
}

#[async_trait]
impl Handler for FixedTargetHandler {
    async fn handle(self: Box<Self>, conn: BoxedConn) -> anyhow::Result<()> {
        let summary = relay(conn, "tcp", &self.target, &self.ctx).await?;
        info!(
            address = %summary.address,
            rewritten = summary.rewritten,
            bytes_sent = summary.sent,
            bytes_received = summary.received,
            closed_by = %summary.end.direction,
            "Session closed"
        );
        Ok(())
    }
}
