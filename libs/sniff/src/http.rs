//! Host extraction from an HTTP/1.x request head.

use std::io;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::SniffError;
use crate::tls::normalize_hostname;

/// Maximum number of headers parsed from a request head.
const MAX_HEADERS: usize = 64;

/// Terminator of the request head.
const HEAD_END: &[u8] = b"\r\n\r\n";

/// Read until the end of the request head, EOF, or `max_bytes`.
///
/// Gives up after the first read if the data cannot start a request line.
pub(crate) async fn read_request_head<R: AsyncRead + Unpin>(
    stream: &mut R,
    buffer: &mut BytesMut,
    max_bytes: usize,
) -> io::Result<()> {
    loop {
        if buffer.len() >= max_bytes || contains_head_end(buffer) {
            return Ok(());
        }
        if !buffer.is_empty() && !buffer[0].is_ascii_uppercase() {
            return Ok(());
        }

        let remaining = max_bytes - buffer.len();
        let n = stream.read_buf(&mut (&mut *buffer).limit(remaining)).await?;
        if n == 0 {
            return Ok(());
        }
    }
}

fn contains_head_end(data: &[u8]) -> bool {
    data.windows(HEAD_END.len()).any(|w| w == HEAD_END)
}

/// Parse the request head and return the requested host.
///
/// The `Host` header wins; an absolute-form request target
/// (`GET http://host/ HTTP/1.1`) is used when the header is missing.
/// Any port is left in place.
pub(crate) fn parse_host(data: &[u8]) -> Result<String, SniffError> {
    if data.is_empty() {
        return Err(SniffError::NotHttp);
    }

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);

    match request.parse(data) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            if request.version.is_none() {
                return Err(SniffError::NotHttp);
            }
            return Err(SniffError::Malformed("truncated HTTP request head"));
        }
        Err(_) if request.version.is_none() => return Err(SniffError::NotHttp),
        Err(_) => return Err(SniffError::Malformed("HTTP request head")),
    }

    if let Some(header) = request
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("host"))
    {
        let value = std::str::from_utf8(header.value)
            .map_err(|_| SniffError::Malformed("Host header"))?;
        return Ok(normalize_hostname(value.trim()));
    }

    request
        .path
        .and_then(absolute_form_authority)
        .map(normalize_hostname)
        .ok_or(SniffError::NoHost)
}

/// Authority of an absolute-form target, e.g. `host:8080` in
/// `http://user@host:8080/path`.
fn absolute_form_authority(target: &str) -> Option<&str> {
    let (scheme, rest) = target.split_once("://")?;
    if !scheme.eq_ignore_ascii_case("http") && !scheme.eq_ignore_ascii_case("https") {
        return None;
    }

    let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let authority = &rest[..end];
    let authority = authority.rsplit_once('@').map_or(authority, |(_, host)| host);

    (!authority.is_empty()).then_some(authority)
}
