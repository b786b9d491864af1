//! Error types for the relay core.

use std::io;

use thiserror::Error;

use crate::proxy::Direction;

/// Errors from splitting a `host:port` address.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    /// No `:port` suffix.
    #[error("address {0}: missing port in address")]
    MissingPort(String),

    /// An unbracketed host containing `:`.
    #[error("address {0}: too many colons in address")]
    TooManyColons(String),

    /// `[` without a matching `]`.
    #[error("address {0}: missing ']' in address")]
    MissingBracket(String),

    /// A bracket outside of a bracketed host.
    #[error("address {0}: unexpected '{1}' in address")]
    UnexpectedBracket(String, char),
}

/// A handler factory declined a connection.
///
/// Never fatal: the registry rolls the connection back and tries the next
/// factory.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The connection does not speak this factory's protocol.
    #[error("protocol not handled: {0}")]
    NoHandle(String),

    /// Reading while matching failed.
    #[error("i/o error while matching: {0}")]
    Io(#[from] io::Error),
}

impl HandlerError {
    /// Convenience constructor for [`HandlerError::NoHandle`].
    pub fn no_handle(reason: impl Into<String>) -> Self {
        Self::NoHandle(reason.into())
    }
}

/// A forwarding session ended on an I/O failure.
///
/// Idle timeouts surface as [`io::ErrorKind::TimedOut`].
#[derive(Debug, Error)]
pub enum ForwardError {
    /// Reading from the source side failed.
    #[error("forward read error ({direction}): {source}")]
    Read {
        direction: Direction,
        #[source]
        source: io::Error,
    },

    /// Writing to the destination side failed.
    #[error("forward write error ({direction}): {source}")]
    Write {
        direction: Direction,
        #[source]
        source: io::Error,
    },
}

impl ForwardError {
    /// The direction that failed.
    pub fn direction(&self) -> Direction {
        match self {
            Self::Read { direction, .. } | Self::Write { direction, .. } => *direction,
        }
    }

    /// The underlying I/O error.
    pub fn io_error(&self) -> &io::Error {
        match self {
            Self::Read { source, .. } | Self::Write { source, .. } => source,
        }
    }

    /// Whether the session ended because it was idle for too long.
    pub fn is_timeout(&self) -> bool {
        self.io_error().kind() == io::ErrorKind::TimedOut
    }
}
