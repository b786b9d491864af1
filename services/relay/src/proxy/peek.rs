//! Stream peek and destination rewrite.
//!
//! Sniffs the hostname a client is asking for and rewrites the destination to
//! `hostname:original_port`. The connection handed back replays every byte
//! read while sniffing, whether or not sniffing worked, so callers must always
//! continue with the returned connection.

use plfm_sniff::{Sniffed, Sniffer};
use tracing::debug;

use super::address::{join_host_port, split_host_port};
use super::detect::PreProtocol;
use super::stream::BoxedConn;

/// Outcome of a peek.
pub struct Peeked {
    /// The connection to use from now on.
    pub conn: BoxedConn,
    /// Destination to connect to: rewritten on success, the original otherwise.
    pub address: String,
    /// Whether the destination was rewritten.
    pub ok: bool,
}

impl Peeked {
    fn unchanged(conn: BoxedConn, address: &str) -> Self {
        Self {
            conn,
            address: address.to_string(),
            ok: false,
        }
    }
}

/// Peek with a default-configured sniffer.
pub async fn peek(conn: BoxedConn, address: &str, protocol: PreProtocol) -> Peeked {
    peek_with(&Sniffer::new(), conn, address, protocol).await
}

/// Sniff `conn` for `protocol` and rewrite `address`.
///
/// The port of `address` is always kept; any port inside the sniffed host is
/// discarded.
pub async fn peek_with(
    sniffer: &Sniffer,
    conn: BoxedConn,
    address: &str,
    protocol: PreProtocol,
) -> Peeked {
    let port = match split_host_port(address) {
        Ok((_, port)) => port,
        Err(e) => {
            debug!(address = %address, error = %e, "Peek skipped: bad address");
            return Peeked::unchanged(conn, address);
        }
    };

    let sniffed = match protocol {
        PreProtocol::Http => sniffer.http(conn).await,
        PreProtocol::Https => sniffer.tls(conn).await,
        PreProtocol::Unknown => return Peeked::unchanged(conn, address),
    };

    let (conn, raw_host) = match sniffed {
        Ok(sniffed) => adopt(sniffed),
        Err(failure) => {
            let (conn, error) = failure.into_parts();
            debug!(address = %address, protocol = ?protocol, error = %error, "Peek failed");
            return Peeked::unchanged(Box::new(conn), address);
        }
    };

    let host = host_without_port(&raw_host);
    if host.is_empty() {
        debug!(address = %address, protocol = ?protocol, "Peek found an empty host");
        return Peeked::unchanged(conn, address);
    }

    let rewritten = join_host_port(host, port);
    debug!(address = %address, rewritten = %rewritten, "Destination rewritten");

    Peeked {
        conn,
        address: rewritten,
        ok: true,
    }
}

/// Read the host, then release the sniff state.
fn adopt(sniffed: Sniffed<BoxedConn>) -> (BoxedConn, String) {
    let host = sniffed.host().to_string();
    (Box::new(sniffed.release()), host)
}

/// Strip a port (and IPv6 brackets) from a sniffed host.
fn host_without_port(raw: &str) -> &str {
    match split_host_port(raw) {
        Ok((host, _)) => host,
        Err(_) => raw
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(raw),
    }
}
