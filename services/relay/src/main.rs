//! plfm-vt Relay
//!
//! Transparent TCP relay.
//!
//! This service:
//! - Accepts TCP connections on the configured listener
//! - Claims each connection with a protocol handler (HTTP CONNECT, or a fixed
//!   upstream when one is configured)
//! - Recovers the hostname of literal-IP HTTP/TLS destinations from the Host
//!   header or SNI
//! - Forwards bytes both ways until either side closes or goes idle

use std::sync::Arc;

use anyhow::Result;
use plfm_relay::config::Config;
use plfm_relay::{
    ConnectFactory, FixedTargetFactory, HandlerRegistry, Listener, PreDetector, RelayContext,
};
use plfm_sniff::Sniffer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to GHOST_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting plfm-vt relay");
    info!(
        listen_addr = %config.listen_addr,
        upstream = config.upstream.as_deref().unwrap_or("-"),
        http_ports = ?config.http_ports,
        https_ports = ?config.https_ports,
        max_connections = config.max_connections,
        "Configuration loaded"
    );

    let detector = Arc::new(PreDetector::with_ports(config.port_table()));
    let ctx = Arc::new(
        RelayContext::new(detector)
            .with_timeouts(config.timeouts())
            .with_sniffer(Sniffer::with_config(config.sniff_config())),
    );

    let mut registry = HandlerRegistry::new();
    match &config.upstream {
        Some(upstream) => {
            registry.register(FixedTargetFactory::new(upstream.clone(), Arc::clone(&ctx)));
        }
        None => {
            registry.register(
                ConnectFactory::new(Arc::clone(&ctx)).with_reply_timeout(config.hello_timeout),
            );
        }
    }

    let listener = Arc::new(Listener::bind(config.listener_config(), Arc::new(registry)).await?);
    listener.run().await?;

    Ok(())
}
