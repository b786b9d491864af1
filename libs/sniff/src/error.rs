//! Error types for sniffing.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Reasons a sniff did not produce a hostname.
#[derive(Debug, Error)]
pub enum SniffError {
    /// The stream does not start with a TLS handshake record.
    #[error("not a TLS ClientHello")]
    NotTls,

    /// The ClientHello carries no server_name extension.
    #[error("TLS ClientHello has no server_name")]
    NoSni,

    /// The stream does not start with an HTTP/1.x request.
    #[error("not an HTTP/1.x request")]
    NotHttp,

    /// The request head has neither a Host header nor an absolute-form target.
    #[error("HTTP request has no host")]
    NoHost,

    /// The data looked like the protocol but could not be parsed.
    #[error("malformed {0}")]
    Malformed(&'static str),

    /// Not enough data arrived in time.
    #[error("sniff timed out after {0:?}")]
    Timeout(Duration),

    /// Reading from the stream failed.
    #[error("i/o error while sniffing: {0}")]
    Io(#[from] io::Error),
}
