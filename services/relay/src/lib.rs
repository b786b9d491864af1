//! plfm-vt Relay
//!
//! Transparent TCP relay core: handler dispatch with rollback, hostname
//! recovery for literal-IP destinations, and duplex forwarding.

pub mod config;
pub mod error;
pub mod handler;
pub mod proxy;

pub use error::{AddressError, ForwardError, HandlerError};
pub use handler::{
    Claim, ConnectFactory, Dispatched, FixedTargetFactory, Handler, HandlerFactory,
    HandlerRegistry, Unclaimed,
};
pub use proxy::{
    forward, peek, relay, BoxedConn, Direction, ForwardCounters, ForwardEnd, Listener,
    ListenerConfig, Peeked, PortTable, PreDetector, PreProtocol, RelayContext, Rewind, Timeouts,
};
