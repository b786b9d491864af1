//! SNI (Server Name Indication) extraction from a TLS ClientHello.
//!
//! Only the first TLS record is inspected. The record header announces how
//! many bytes to wait for, capped by the configured maximum.

use std::io;

use bytes::BytesMut;
use tokio::io::AsyncRead;
use tracing::debug;

use crate::error::SniffError;
use crate::fill_to;

/// TLS record content type for handshake messages.
const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;

/// Handshake message type of a ClientHello.
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;

/// Extension type of server_name.
const EXTENSION_SERVER_NAME: u16 = 0x0000;

/// Name type of a DNS hostname inside server_name.
const NAME_TYPE_HOST_NAME: u8 = 0x00;

/// TLS record header length.
const RECORD_HEADER_LEN: usize = 5;

/// Read enough of the first TLS record to parse the ClientHello.
///
/// Stops early on EOF or when the first byte rules out a handshake record;
/// parsing decides what to make of what was read.
pub(crate) async fn read_client_hello<R: AsyncRead + Unpin>(
    stream: &mut R,
    buffer: &mut BytesMut,
    max_bytes: usize,
) -> io::Result<()> {
    if !fill_to(stream, buffer, RECORD_HEADER_LEN.min(max_bytes)).await? {
        return Ok(());
    }

    if buffer.len() < RECORD_HEADER_LEN || buffer[0] != CONTENT_TYPE_HANDSHAKE {
        return Ok(());
    }

    // We accept SSL 3.0 through TLS 1.2 in the record layer (TLS 1.3 still says 0x0301/0x0303)
    let version = u16::from_be_bytes([buffer[1], buffer[2]]);
    if !(0x0300..=0x0303).contains(&version) {
        debug!(version = version, "Unexpected TLS record version");
    }

    let record_len = u16::from_be_bytes([buffer[3], buffer[4]]) as usize;
    let target_len = (RECORD_HEADER_LEN + record_len).min(max_bytes);
    fill_to(stream, buffer, target_len).await?;

    Ok(())
}

/// Parse the SNI hostname from the start of a TLS stream.
///
/// TLS record:
/// - byte 0: record type (0x16 = Handshake)
/// - bytes 1-2: version
/// - bytes 3-4: record length
/// - bytes 5+: handshake message
///
/// Handshake ClientHello:
/// - byte 0: handshake type (0x01 = ClientHello)
/// - bytes 1-3: length
/// - bytes 4-5: client version
/// - bytes 6-37: random (32 bytes)
/// - byte 38: session ID length, then session ID
/// - 2 bytes: cipher suites length, then cipher suites
/// - 1 byte: compression methods length, then compression methods
/// - 2 bytes: extensions length, then extensions
pub(crate) fn parse_sni(data: &[u8]) -> Result<String, SniffError> {
    if data.is_empty() {
        return Err(SniffError::NotTls);
    }
    if data[0] != CONTENT_TYPE_HANDSHAKE {
        return Err(SniffError::NotTls);
    }

    // Record header (5) + handshake type (1) + length (3)
    if data.len() < RECORD_HEADER_LEN + 4 {
        return Err(SniffError::Malformed("TLS record"));
    }

    let handshake = &data[RECORD_HEADER_LEN..];
    if handshake[0] != HANDSHAKE_CLIENT_HELLO {
        return Err(SniffError::NotTls);
    }

    let client_hello = &handshake[4..];
    if client_hello.len() < 34 {
        return Err(SniffError::Malformed("ClientHello"));
    }

    // Skip version (2) + random (32)
    let mut pos = 34;

    // Session ID
    if pos >= client_hello.len() {
        return Err(SniffError::Malformed("ClientHello session id"));
    }
    let session_id_len = client_hello[pos] as usize;
    pos += 1 + session_id_len;

    // Cipher suites
    if pos + 2 > client_hello.len() {
        return Err(SniffError::Malformed("ClientHello cipher suites"));
    }
    let cipher_suites_len =
        u16::from_be_bytes([client_hello[pos], client_hello[pos + 1]]) as usize;
    pos += 2 + cipher_suites_len;

    // Compression methods
    if pos >= client_hello.len() {
        return Err(SniffError::Malformed("ClientHello compression methods"));
    }
    let compression_len = client_hello[pos] as usize;
    pos += 1 + compression_len;

    // No extensions at all
    if pos + 2 > client_hello.len() {
        return Err(SniffError::NoSni);
    }
    let extensions_len = u16::from_be_bytes([client_hello[pos], client_hello[pos + 1]]) as usize;
    pos += 2;

    let extensions_end = (pos + extensions_len).min(client_hello.len());

    while pos + 4 <= extensions_end {
        let ext_type = u16::from_be_bytes([client_hello[pos], client_hello[pos + 1]]);
        let ext_len = u16::from_be_bytes([client_hello[pos + 2], client_hello[pos + 3]]) as usize;
        pos += 4;

        if ext_type == EXTENSION_SERVER_NAME {
            let end = (pos + ext_len).min(client_hello.len());
            return parse_server_name(&client_hello[pos..end]);
        }

        pos += ext_len;
    }

    Err(SniffError::NoSni)
}

/// Parse the server_name extension body.
///
/// - 2 bytes: list length
/// - per entry: name type (1), name length (2), name
fn parse_server_name(data: &[u8]) -> Result<String, SniffError> {
    if data.len() < 2 {
        return Err(SniffError::Malformed("server_name extension"));
    }

    let list_len = u16::from_be_bytes([data[0], data[1]]) as usize;
    if data.len() < 2 + list_len {
        return Err(SniffError::Malformed("server_name list"));
    }

    let mut pos = 2;
    while pos + 3 <= 2 + list_len {
        let name_type = data[pos];
        let name_len = u16::from_be_bytes([data[pos + 1], data[pos + 2]]) as usize;
        pos += 3;

        if name_type == NAME_TYPE_HOST_NAME {
            if pos + name_len > data.len() {
                return Err(SniffError::Malformed("server_name host name"));
            }

            return std::str::from_utf8(&data[pos..pos + name_len])
                .map(normalize_hostname)
                .map_err(|_| SniffError::Malformed("server_name host name"));
        }

        pos += name_len;
    }

    Err(SniffError::NoSni)
}

/// Lowercase and trim the trailing dot.
pub(crate) fn normalize_hostname(hostname: &str) -> String {
    hostname.to_lowercase().trim_end_matches('.').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use plfm_testing::tls::client_hello;

    #[test]
    fn test_parse_sni_found() {
        let hello = client_hello(Some("example.com"));
        assert_eq!(parse_sni(&hello).unwrap(), "example.com");
    }

    #[test]
    fn test_parse_sni_normalizes() {
        let hello = client_hello(Some("WWW.Example.COM."));
        assert_eq!(parse_sni(&hello).unwrap(), "www.example.com");
    }

    #[test]
    fn test_parse_no_sni() {
        let hello = client_hello(None);
        assert!(matches!(parse_sni(&hello), Err(SniffError::NoSni)));
    }

    #[test]
    fn test_parse_not_tls() {
        let http_request = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
        assert!(matches!(parse_sni(http_request), Err(SniffError::NotTls)));
    }

    #[test]
    fn test_parse_too_short() {
        let result = parse_sni(&[0x16, 0x03, 0x01]);
        assert!(matches!(result, Err(SniffError::Malformed(_))));
    }

    #[test]
    fn test_parse_truncated_hello() {
        let hello = client_hello(Some("example.com"));
        let result = parse_sni(&hello[..40]);
        assert!(matches!(result, Err(SniffError::Malformed(_))));
    }

    #[test]
    fn test_normalize_trailing_dot() {
        assert_eq!(normalize_hostname("EXAMPLE.COM."), "example.com");
    }
}
