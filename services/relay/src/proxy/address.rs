//! `host:port` address handling.
//!
//! Hosts may be names, IPv4 literals or bracketed IPv6 literals
//! (`[2001:db8::1]:443`). Ports are kept as text; callers that need a number
//! parse it themselves.

use crate::error::AddressError;

/// Split `host:port` into host and port.
///
/// Brackets around an IPv6 host are removed.
pub fn split_host_port(address: &str) -> Result<(&str, &str), AddressError> {
    let Some(colon) = address.rfind(':') else {
        return Err(AddressError::MissingPort(address.to_string()));
    };

    let (host, host_start, host_end) = if address.starts_with('[') {
        let Some(close) = address.find(']') else {
            return Err(AddressError::MissingBracket(address.to_string()));
        };
        if close + 1 == address.len() {
            return Err(AddressError::MissingPort(address.to_string()));
        }
        if close + 1 != colon {
            return Err(if address.as_bytes()[close + 1] == b':' {
                AddressError::TooManyColons(address.to_string())
            } else {
                AddressError::MissingPort(address.to_string())
            });
        }
        (&address[1..close], 1, close + 1)
    } else {
        let host = &address[..colon];
        if host.contains(':') {
            return Err(AddressError::TooManyColons(address.to_string()));
        }
        (host, 0, 0)
    };

    if address[host_start..].contains('[') {
        return Err(AddressError::UnexpectedBracket(address.to_string(), '['));
    }
    if address[host_end..].contains(']') {
        return Err(AddressError::UnexpectedBracket(address.to_string(), ']'));
    }

    Ok((host, &address[colon + 1..]))
}

/// Join host and port, bracketing hosts that contain `:`.
pub fn join_host_port(host: &str, port: &str) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
