//! Non-destructive protocol sniffing for TCP streams.
//!
//! Extracts the application-level hostname a client is asking for, either from
//! the SNI extension of a TLS ClientHello or from the `Host` of an HTTP/1.x
//! request, without losing any byte of the stream:
//!
//! - every byte read while sniffing is kept and replayed through [`Prefixed`]
//! - on success, [`Sniffed::release`] hands back the replaying stream
//! - on failure, [`SniffFailure`] still carries the replaying stream
//!
//! ## Usage
//!
//! ```ignore
//! match plfm_sniff::sniff_tls(stream).await {
//!     Ok(sniffed) => {
//!         let host = sniffed.host().to_string();
//!         let stream = sniffed.release();
//!         // route on `host`, forward `stream`
//!     }
//!     Err(failure) => {
//!         let (stream, error) = failure.into_parts();
//!         // route on the original address, forward `stream`
//!     }
//! }
//! ```

mod error;
mod http;
mod prefixed;
mod tls;

use std::fmt;
use std::io;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;
use tracing::debug;

pub use error::SniffError;
pub use prefixed::Prefixed;

/// Default timeout for a sniff.
pub const DEFAULT_SNIFF_TIMEOUT: Duration = Duration::from_millis(200);

/// Default maximum bytes read while sniffing.
pub const DEFAULT_MAX_SNIFF_BYTES: usize = 8192;

/// Configuration for sniffing.
#[derive(Debug, Clone)]
pub struct SniffConfig {
    /// Maximum time to wait for enough data.
    pub timeout: Duration,
    /// Maximum bytes to read.
    pub max_bytes: usize,
}

impl Default for SniffConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_SNIFF_TIMEOUT,
            max_bytes: DEFAULT_MAX_SNIFF_BYTES,
        }
    }
}

/// A stream whose hostname has been extracted.
pub struct Sniffed<C> {
    conn: Prefixed<C>,
    host: String,
}

impl<C> Sniffed<C> {
    /// The extracted hostname, as sent by the client (it may carry a port).
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Drop the sniff state and return the stream, which replays every byte
    /// read while sniffing.
    pub fn release(self) -> Prefixed<C> {
        self.conn
    }
}

impl<C> fmt::Debug for Sniffed<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sniffed")
            .field("host", &self.host)
            .field("buffered", &self.conn.prefix().len())
            .finish()
    }
}

/// A failed sniff. The stream is still usable and replays what was read.
pub struct SniffFailure<C> {
    conn: Prefixed<C>,
    error: SniffError,
}

impl<C> SniffFailure<C> {
    /// Why the sniff failed.
    pub fn error(&self) -> &SniffError {
        &self.error
    }

    /// Split into the replaying stream and the error.
    pub fn into_parts(self) -> (Prefixed<C>, SniffError) {
        (self.conn, self.error)
    }
}

impl<C> fmt::Debug for SniffFailure<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SniffFailure")
            .field("error", &self.error)
            .field("buffered", &self.conn.prefix().len())
            .finish()
    }
}

impl<C> fmt::Display for SniffFailure<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.error, f)
    }
}

/// Protocol sniffer.
#[derive(Debug, Clone, Default)]
pub struct Sniffer {
    config: SniffConfig,
}

impl Sniffer {
    /// Create a sniffer with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a sniffer with custom configuration.
    pub fn with_config(config: SniffConfig) -> Self {
        Self { config }
    }

    /// Get the configuration.
    pub fn config(&self) -> &SniffConfig {
        &self.config
    }

    /// Extract the SNI hostname from a TLS ClientHello.
    pub async fn tls<C: AsyncRead + Unpin>(
        &self,
        mut conn: C,
    ) -> Result<Sniffed<C>, SniffFailure<C>> {
        let mut buffer = BytesMut::with_capacity(self.config.max_bytes.min(1024));
        let read = timeout(
            self.config.timeout,
            tls::read_client_hello(&mut conn, &mut buffer, self.config.max_bytes),
        )
        .await;

        let outcome = match read {
            Ok(Ok(())) => tls::parse_sni(&buffer),
            Ok(Err(e)) => Err(SniffError::Io(e)),
            Err(_) => Err(SniffError::Timeout(self.config.timeout)),
        };

        finish("tls", buffer, conn, outcome)
    }

    /// Extract the host from an HTTP/1.x request head.
    pub async fn http<C: AsyncRead + Unpin>(
        &self,
        mut conn: C,
    ) -> Result<Sniffed<C>, SniffFailure<C>> {
        let mut buffer = BytesMut::with_capacity(self.config.max_bytes.min(1024));
        let read = timeout(
            self.config.timeout,
            http::read_request_head(&mut conn, &mut buffer, self.config.max_bytes),
        )
        .await;

        let outcome = match read {
            Ok(Ok(())) => http::parse_host(&buffer),
            Ok(Err(e)) => Err(SniffError::Io(e)),
            Err(_) => Err(SniffError::Timeout(self.config.timeout)),
        };

        finish("http", buffer, conn, outcome)
    }
}

/// Sniff a TLS ClientHello with the default configuration.
pub async fn sniff_tls<C: AsyncRead + Unpin>(conn: C) -> Result<Sniffed<C>, SniffFailure<C>> {
    Sniffer::new().tls(conn).await
}

/// Sniff an HTTP/1.x request head with the default configuration.
pub async fn sniff_http<C: AsyncRead + Unpin>(conn: C) -> Result<Sniffed<C>, SniffFailure<C>> {
    Sniffer::new().http(conn).await
}

fn finish<C>(
    protocol: &'static str,
    buffer: BytesMut,
    conn: C,
    outcome: Result<String, SniffError>,
) -> Result<Sniffed<C>, SniffFailure<C>> {
    let buffered = buffer.len();
    let conn = Prefixed::new(buffer.freeze(), conn);

    match outcome {
        Ok(host) => {
            debug!(protocol, host = %host, buffered, "Sniffed host");
            Ok(Sniffed { conn, host })
        }
        Err(error) => {
            debug!(protocol, error = %error, buffered, "Sniff failed");
            Err(SniffFailure { conn, error })
        }
    }
}

/// Read until `buffer` holds `target` bytes. Returns false on EOF.
///
/// Reads go straight into `buffer`, so whatever arrived before a timeout
/// cancels this future is kept.
pub(crate) async fn fill_to<R: AsyncRead + Unpin>(
    stream: &mut R,
    buffer: &mut BytesMut,
    target: usize,
) -> io::Result<bool> {
    while buffer.len() < target {
        let remaining = target - buffer.len();
        let n = stream.read_buf(&mut (&mut *buffer).limit(remaining)).await?;
        if n == 0 {
            return Ok(false);
        }
    }
    Ok(true)
}
