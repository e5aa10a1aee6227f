//! HTTP forward proxy.
//!
//! # Architecture Overview
//!
//! ```text
//!                     ┌──────────────────────────────────────────────┐
//!                     │                FORWARD PROXY                 │
//!   Client            │  ┌──────────┐   ┌──────────┐   ┌──────────┐  │
//!   ──────────────────┼─▶│   net    │──▶│   http   │──▶│   net    │──┼──▶ Origin
//!                     │  │ listener │   │ handler  │   │  dialer  │  │
//!                     │  └──────────┘   └────┬─────┘   └──────────┘  │
//!                     │                      │                       │
//!                     │           CONNECT    ▼     plain HTTP        │
//!                     │        ┌──────────────┐  ┌────────────────┐  │
//!   ◀─────────────────┼────────│  net::relay  │  │ response copy  │──┼───
//!                     │        └──────────────┘  └────────────────┘  │
//!                     │                                              │
//!                     │  config · lifecycle · observability          │
//!                     └──────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

use forward_proxy::config::{self, ConfigError, ProxyConfig};
use forward_proxy::lifecycle::signals::spawn_signal_handler;
use forward_proxy::observability::{logging, metrics};
use forward_proxy::ProxyServer;

#[derive(Parser)]
#[command(name = "forward-proxy")]
#[command(about = "HTTP forward proxy with CONNECT tunnelling", long_about = None)]
struct Cli {
    /// Listen address, overrides the config file.
    #[arg(short, long)]
    listen: Option<String>,

    /// Path to a TOML config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => ProxyConfig::default(),
    };
    if let Some(listen) = cli.listen {
        config.listener.bind_address = listen;
    }
    if let Some(level) = cli.log_level {
        config.observability.log_level = level;
    }
    config::validate_config(&config).map_err(ConfigError::Validation)?;

    logging::init_logging(&config.observability)?;
    tracing::info!("forward-proxy v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        bind_address = %config.listener.bind_address,
        max_connections = config.listener.max_connections,
        handshake_timeout_secs = config.timeouts.handshake_secs,
        connect_timeout_secs = config.timeouts.connect_secs,
        relay_grace_secs = config.timeouts.relay_grace_secs,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        // Validated above.
        if let Ok(addr) = config.observability.metrics_address.parse::<SocketAddr>() {
            metrics::init_metrics(addr);
        }
    }

    let drain_timeout = config.lifecycle.drain_timeout();
    let server = ProxyServer::new(config);
    spawn_signal_handler(server.shutdown_handle());

    if let Err(e) = server.listen().await {
        tracing::error!(error = %e, "Proxy server failed");
        return Err(e.into());
    }

    let in_flight = server.active_connections();
    if in_flight > 0 {
        tracing::info!(in_flight, timeout = ?drain_timeout, "Draining connections");
        if !server.drain(drain_timeout).await {
            tracing::warn!(
                remaining = server.active_connections(),
                "Drain timeout reached, abandoning connections"
            );
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
