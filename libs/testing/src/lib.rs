//! Shared test fixtures.
//!
//! Byte-level builders for the protocol openings the relay sniffs, so unit
//! and integration tests in different crates agree on what a "valid"
//! ClientHello or request head looks like.

pub mod tls {
    /// Build a single-record TLS 1.2 ClientHello.
    ///
    /// Lengths are consistent, so a reader that trusts the record header
    /// stops exactly at the end of the record.
    pub fn client_hello(server_name: Option<&str>) -> Vec<u8> {
        let mut extensions = Vec::new();

        if let Some(name) = server_name {
            let name = name.as_bytes();
            let list_len = 3 + name.len();
            extensions.extend_from_slice(&0x0000u16.to_be_bytes()); // server_name
            extensions.extend_from_slice(&((list_len + 2) as u16).to_be_bytes());
            extensions.extend_from_slice(&(list_len as u16).to_be_bytes());
            extensions.push(0x00); // host_name
            extensions.extend_from_slice(&(name.len() as u16).to_be_bytes());
            extensions.extend_from_slice(name);
        }

        // ec_point_formats: uncompressed
        extensions.extend_from_slice(&[0x00, 0x0b, 0x00, 0x02, 0x01, 0x00]);

        let mut body = vec![0x03, 0x03]; // TLS 1.2
        body.extend_from_slice(&[0x5a; 32]); // random
        body.push(0x00); // session id length
        body.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]); // one cipher suite
        body.extend_from_slice(&[0x01, 0x00]); // null compression
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        let mut handshake = vec![0x01]; // ClientHello
        handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        let mut record = vec![0x16, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }
}

pub mod http {
    /// Build a GET request head with the given Host header.
    pub fn get_request(host: &str, path: &str) -> Vec<u8> {
        format!("GET {path} HTTP/1.1\r\nHost: {host}\r\nUser-Agent: relay-test\r\nAccept: */*\r\n\r\n")
            .into_bytes()
    }

    /// Build a CONNECT request head for `target`.
    pub fn connect_request(target: &str) -> Vec<u8> {
        format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n").into_bytes()
    }
}
