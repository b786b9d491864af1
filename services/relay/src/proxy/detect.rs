//! Protocol pre-detection.
//!
//! Decides whether a destination is worth peeking at. Peeking only helps when
//! the destination carries no hostname: a literal IP on a port known to carry
//! HTTP or TLS. The port table can be swapped at runtime without blocking
//! sessions that are classifying concurrently.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::info;

use super::address::split_host_port;

/// Default ports treated as plain HTTP.
pub const DEFAULT_HTTP_PORTS: &[u16] = &[80];

/// Default ports treated as TLS.
pub const DEFAULT_HTTPS_PORTS: &[u16] = &[443];

/// Protocol a destination is expected to carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PreProtocol {
    /// Not eligible for peeking.
    #[default]
    Unknown,
    /// Plain HTTP/1.x; the `Host` header names the destination.
    Http,
    /// TLS; the ClientHello SNI names the destination.
    Https,
}

/// Port-to-protocol table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortTable {
    http: BTreeSet<u16>,
    https: BTreeSet<u16>,
}

impl PortTable {
    /// Create a table from explicit port sets.
    pub fn new(
        http: impl IntoIterator<Item = u16>,
        https: impl IntoIterator<Item = u16>,
    ) -> Self {
        Self {
            http: http.into_iter().collect(),
            https: https.into_iter().collect(),
        }
    }

    /// Ports treated as HTTP.
    pub fn http_ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.http.iter().copied()
    }

    /// Ports treated as TLS.
    pub fn https_ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.https.iter().copied()
    }

    /// Protocol for a port. HTTP wins if a port is in both sets.
    pub fn protocol_for(&self, port: u16) -> PreProtocol {
        if self.http.contains(&port) {
            PreProtocol::Http
        } else if self.https.contains(&port) {
            PreProtocol::Https
        } else {
            PreProtocol::Unknown
        }
    }

    /// Classify a destination.
    ///
    /// Returns [`PreProtocol::Unknown`] unless the network is TCP, the address
    /// splits into host and port, the host is a literal IP, and the port is
    /// numeric and listed in the table.
    pub fn classify(&self, network: &str, address: &str) -> PreProtocol {
        if !network.starts_with("tcp") {
            return PreProtocol::Unknown;
        }

        let Ok((host, port)) = split_host_port(address) else {
            return PreProtocol::Unknown;
        };

        if host.parse::<IpAddr>().is_err() {
            return PreProtocol::Unknown;
        }

        match port.parse::<u16>() {
            Ok(port) => self.protocol_for(port),
            Err(_) => PreProtocol::Unknown,
        }
    }
}

impl Default for PortTable {
    fn default() -> Self {
        Self::new(
            DEFAULT_HTTP_PORTS.iter().copied(),
            DEFAULT_HTTPS_PORTS.iter().copied(),
        )
    }
}

/// Shared pre-detector with a replaceable port table.
#[derive(Debug)]
pub struct PreDetector {
    ports: ArcSwap<PortTable>,
}

impl PreDetector {
    /// Create a pre-detector with the default port table.
    pub fn new() -> Self {
        Self::with_ports(PortTable::default())
    }

    /// Create a pre-detector with a custom port table.
    pub fn with_ports(ports: PortTable) -> Self {
        Self {
            ports: ArcSwap::from_pointee(ports),
        }
    }

    /// Current port table.
    pub fn ports(&self) -> Arc<PortTable> {
        self.ports.load_full()
    }

    /// Replace the port table atomically.
    pub fn set_ports(&self, ports: PortTable) {
        info!(
            http_ports = ?ports.http,
            https_ports = ?ports.https,
            "Pre-detection ports updated"
        );
        self.ports.store(Arc::new(ports));
    }

    /// Classify a destination against the current port table.
    pub fn classify(&self, network: &str, address: &str) -> PreProtocol {
        self.ports.load().classify(network, address)
    }
}

impl Default for PreDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_default_ports() {
        let detector = PreDetector::new();
        assert_eq!(detector.classify("tcp", "93.184.216.34:80"), PreProtocol::Http);
        assert_eq!(detector.classify("tcp", "93.184.216.34:443"), PreProtocol::Https);
        assert_eq!(detector.classify("tcp", "93.184.216.34:8080"), PreProtocol::Unknown);
    }

    #[test]
    fn test_ipv6_literal() {
        let detector = PreDetector::new();
        assert_eq!(detector.classify("tcp6", "[2001:db8::1]:443"), PreProtocol::Https);
    }

    #[test]
    fn test_hostname_is_unknown() {
        let detector = PreDetector::new();
        assert_eq!(detector.classify("tcp", "example.com:80"), PreProtocol::Unknown);
        assert_eq!(detector.classify("tcp", "example.com:443"), PreProtocol::Unknown);
    }

    #[test]
    fn test_non_tcp_is_unknown() {
        let detector = PreDetector::new();
        assert_eq!(detector.classify("udp", "93.184.216.34:443"), PreProtocol::Unknown);
        assert_eq!(detector.classify("", "93.184.216.34:80"), PreProtocol::Unknown);
    }

    #[test]
    fn test_bad_address_or_port_is_unknown() {
        let detector = PreDetector::new();
        assert_eq!(detector.classify("tcp", "93.184.216.34"), PreProtocol::Unknown);
        assert_eq!(detector.classify("tcp", "93.184.216.34:http"), PreProtocol::Unknown);
        assert_eq!(detector.classify("tcp", "93.184.216.34:70000"), PreProtocol::Unknown);
    }

    #[test]
    fn test_set_ports() {
        let detector = PreDetector::new();
        detector.set_ports(PortTable::new([8080], [8443, 443]));

        assert_eq!(detector.classify("tcp", "10.0.0.1:80"), PreProtocol::Unknown);
        assert_eq!(detector.classify("tcp", "10.0.0.1:8080"), PreProtocol::Http);
        assert_eq!(detector.classify("tcp", "10.0.0.1:8443"), PreProtocol::Https);
        assert_eq!(detector.ports().https_ports().collect::<Vec<_>>(), vec![443, 8443]);
    }

    #[test]
    fn test_http_wins_on_overlap() {
        let table = PortTable::new([8000], [8000]);
        assert_eq!(table.protocol_for(8000), PreProtocol::Http);
    }

    proptest! {
        #[test]
        fn test_hostnames_never_classified(
            host in "[a-z][a-z0-9-]{0,20}(\\.[a-z]{2,6}){0,2}",
            port in any::<u16>(),
        ) {
            let detector = PreDetector::new();
            let address = format!("{host}:{port}");
            prop_assert_eq!(detector.classify("tcp", &address), PreProtocol::Unknown);
        }

        #[test]
        fn test_ipv4_follows_port_table(octets in any::<[u8; 4]>(), port in any::<u16>()) {
            let detector = PreDetector::new();
            let address = format!("{}.{}.{}.{}:{}", octets[0], octets[1], octets[2], octets[3], port);
            let expected = match port {
                80 => PreProtocol::Http,
                443 => PreProtocol::Https,
                _ => PreProtocol::Unknown,
            };
            prop_assert_eq!(detector.classify("tcp", &address), expected);
        }
    }
}
