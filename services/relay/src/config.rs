//! Relay configuration.
//!
//! Everything is env-driven; unset variables fall back to the defaults below.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use plfm_sniff::SniffConfig;

use crate::proxy::{
    split_host_port, ListenerConfig, PortTable, Timeouts, DEFAULT_HTTPS_PORTS, DEFAULT_HTTP_PORTS,
};

/// Relay configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the listener binds to.
    pub listen_addr: SocketAddr,

    /// Fixed destination for every connection. When unset the relay acts as
    /// an HTTP CONNECT proxy.
    pub upstream: Option<String>,

    /// Literal-IP destination ports sniffed for an HTTP Host.
    pub http_ports: BTreeSet<u16>,

    /// Literal-IP destination ports sniffed for a TLS SNI.
    pub https_ports: BTreeSet<u16>,

    /// Forwarding idle timeout.
    pub idle_timeout: Duration,

    /// Budget for a handler to claim a connection.
    pub hello_timeout: Duration,

    /// Budget for the outbound connect.
    pub connect_timeout: Duration,

    /// Budget for sniffing a hostname.
    pub sniff_timeout: Duration,

    /// Maximum concurrent connections.
    pub max_connections: usize,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let listen_addr: SocketAddr = lookup("GHOST_RELAY_LISTEN_ADDR")
            .unwrap_or_else(|| "[::]:8080".to_string())
            .parse()
            .context("GHOST_RELAY_LISTEN_ADDR must be a socket address (example: [::]:8080).")?;

        let upstream = lookup("GHOST_RELAY_UPSTREAM").filter(|v| !v.is_empty());
        if let Some(upstream) = &upstream {
            split_host_port(upstream)
                .with_context(|| format!("GHOST_RELAY_UPSTREAM must be host:port, got {upstream}"))?;
        }

        let http_ports = match lookup("GHOST_RELAY_HTTP_PORTS") {
            Some(v) => parse_ports(&v).context("GHOST_RELAY_HTTP_PORTS must be a comma separated list of ports.")?,
            None => DEFAULT_HTTP_PORTS.iter().copied().collect(),
        };

        let https_ports = match lookup("GHOST_RELAY_HTTPS_PORTS") {
            Some(v) => parse_ports(&v).context("GHOST_RELAY_HTTPS_PORTS must be a comma separated list of ports.")?,
            None => DEFAULT_HTTPS_PORTS.iter().copied().collect(),
        };

        let idle_timeout_secs: u64 = parse_var(&lookup, "GHOST_RELAY_IDLE_TIMEOUT_SECS")
            .context("GHOST_RELAY_IDLE_TIMEOUT_SECS must be an integer (seconds).")?
            .unwrap_or(600);

        let hello_timeout_ms: u64 = parse_var(&lookup, "GHOST_RELAY_HELLO_TIMEOUT_MS")
            .context("GHOST_RELAY_HELLO_TIMEOUT_MS must be an integer (milliseconds).")?
            .unwrap_or(3000);

        let connect_timeout_ms: u64 = parse_var(&lookup, "GHOST_RELAY_CONNECT_TIMEOUT_MS")
            .context("GHOST_RELAY_CONNECT_TIMEOUT_MS must be an integer (milliseconds).")?
            .unwrap_or(2000);

        let sniff_timeout_ms: u64 = parse_var(&lookup, "GHOST_RELAY_SNIFF_TIMEOUT_MS")
            .context("GHOST_RELAY_SNIFF_TIMEOUT_MS must be an integer (milliseconds).")?
            .unwrap_or(200);

        let max_connections: usize = parse_var(&lookup, "GHOST_RELAY_MAX_CONNECTIONS")
            .context("GHOST_RELAY_MAX_CONNECTIONS must be an integer.")?
            .unwrap_or(10000)
            .max(1);

        let log_level = lookup("GHOST_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            listen_addr,
            upstream,
            http_ports,
            https_ports,
            idle_timeout: Duration::from_secs(idle_timeout_secs.max(1)),
            hello_timeout: Duration::from_millis(hello_timeout_ms.max(10)),
            connect_timeout: Duration::from_millis(connect_timeout_ms.max(10)),
            sniff_timeout: Duration::from_millis(sniff_timeout_ms.max(1)),
            max_connections,
            log_level,
        })
    }

    /// Port table for the pre-detector.
    pub fn port_table(&self) -> PortTable {
        PortTable::new(self.http_ports.iter().copied(), self.https_ports.iter().copied())
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            connect: self.connect_timeout,
            idle: self.idle_timeout,
        }
    }

    pub fn sniff_config(&self) -> SniffConfig {
        SniffConfig {
            timeout: self.sniff_timeout,
            ..SniffConfig::default()
        }
    }

    pub fn listener_config(&self) -> ListenerConfig {
        let mut config = ListenerConfig::new(self.listen_addr);
        config.max_connections = self.max_connections;
        config.hello_timeout = self.hello_timeout;
        config
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    Ok(lookup(key).map(|v| v.trim().parse()).transpose()?)
}

fn parse_ports(value: &str) -> Result<BTreeSet<u16>> {
    let mut ports = BTreeSet::new();
    for part in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let port: u16 = part.parse().with_context(|| format!("invalid port {part:?}"))?;
        if port == 0 {
            bail!("port 0 is not a valid destination port");
        }
        ports.insert(port);
    }
    Ok(ports)
}
