//! online-server: public endpoint of the HTTP reverse tunnel.
//!
//! Accepts WebSocket control channels from clients, assigns each a public
//! TCP port from a bounded range, and forwards inbound HTTP traffic through
//! the control channel.

mod config;
mod control;
mod pending;
mod ports;
mod public;
mod registry;
mod transport;

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use config::{ServerConfig, SHUTDOWN_GRACE};
use control::ControlServer;
use registry::{RegistryConfig, SessionRegistry};

/// online-server — self-hosted HTTP tunnel server
#[derive(Parser, Debug)]
#[command(name = "online-server", version, about = "Self-hosted HTTP tunnel server")]
struct Cli {
    /// Control channel listen address
    #[arg(long, value_name = "HOST:PORT")]
    listen: Option<String>,

    /// Inclusive public port range
    #[arg(long, value_name = "MIN-MAX")]
    port_range: Option<String>,

    /// Deadline for each forwarded request, in seconds
    #[arg(long, value_name = "SECONDS")]
    request_timeout: Option<u64>,

    /// Maximum concurrent tunnels
    #[arg(long, value_name = "N")]
    max_clients: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let config = match ServerConfig::resolve(
        cli.listen.as_deref(),
        cli.port_range.as_deref(),
        cli.request_timeout,
        cli.max_clients,
        &|name| std::env::var(name).ok(),
    ) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };

    let port_range = format!("{}-{}", config.port_min, config.port_max);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %config.listen,
        port_range = %port_range,
        max_clients = config.max_clients,
        "starting online-server"
    );

    let (local_addr, conn_rx) = match transport::start_listener(config.listen).await {
        Ok(started) => started,
        Err(e) => {
            error!(addr = %config.listen, error = %e, "failed to bind control listener");
            std::process::exit(2);
        }
    };

    let registry = Arc::new(SessionRegistry::new(RegistryConfig {
        bind_addr: local_addr.ip(),
        port_min: config.port_min,
        port_max: config.port_max,
        max_clients: config.max_clients,
        request_timeout: config.request_timeout,
    }));

    let server = Arc::new(ControlServer::new(Arc::clone(&registry)));
    let shutdown_tx = server.shutdown_handle();

    tokio::select! {
        _ = Arc::clone(&server).run(conn_rx) => {
            info!("control listener closed, shutting down");
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    // Drain: stop accepting public traffic, let in-flight requests finish,
    // then stop the control loops and tear every session down.
    registry.begin_drain().await;
    registry.wait_drained(SHUTDOWN_GRACE).await;
    let _ = shutdown_tx.send(());
    registry.close_all("server shutdown").await;
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    info!("online-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
