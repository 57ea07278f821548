//! online: expose a local HTTP service through an online-server tunnel.

mod client;
mod forward;

use clap::Parser;
use tracing::{error, info};
use url::Url;

use client::ClientConfig;

/// online — expose a local HTTP service on a public port
#[derive(Parser, Debug)]
#[command(name = "online", version, about = "Expose a local HTTP service through a tunnel server")]
struct Cli {
    /// Local port to expose
    #[arg(long, short = 'p')]
    port: u16,

    /// Tunnel server URL
    #[arg(long, default_value = client::DEFAULT_SERVER_URL)]
    server: String,

    /// Host the local service listens on
    #[arg(long, default_value = "127.0.0.1")]
    local_host: String,

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

    if cli.port == 0 {
        error!("--port must be a real local port");
        std::process::exit(1);
    }
    let server_url = match Url::parse(&cli.server) {
        Ok(url) if matches!(url.scheme(), "ws" | "wss") && url.host_str().is_some() => url,
        Ok(url) => {
            error!(url = %url, "--server must be a ws:// or wss:// URL");
            std::process::exit(1);
        }
        Err(e) => {
            error!(url = %cli.server, error = %e, "invalid --server URL");
            std::process::exit(1);
        }
    };

    let config = ClientConfig {
        server_url,
        local_host: cli.local_host,
        local_port: cli.port,
    };

    tokio::select! {
        result = client::run(config) => {
            if let Err(e) = result {
                error!(error = %e, "giving up");
                std::process::exit(2);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }
}
