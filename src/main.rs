//! API gateway binary.
//!
//! ```text
//!                     ┌──────────────────────────────────────────────┐
//!                     │                 API GATEWAY                  │
//!   Client            │  ┌──────────┐   ┌───────┐                    │
//!   ──────────────────┼─▶│ listener │──▶│ sniff │──┬─▶ upgrade ──────┼──▶ chat /
//!                     │  └──────────┘   └───────┘  │   dispatcher    │    notification
//!                     │                            │  (raw byte pipe)│
//!                     │                            ▼                 │
//!                     │        ┌─────────────────────────────────┐   │
//!                     │        │ axum: cors, request id, tracing │   │
//!                     │        └───────────────┬─────────────────┘   │
//!                     │                        ▼                     │
//!                     │   identity → rate limit → route → forward ───┼──▶ user / post /
//!                     │                                              │    feed / ...
//!                     └──────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;

use api_gateway::config::loader;
use api_gateway::lifecycle::{wait_for_signal, Shutdown};
use api_gateway::net::Listener;
use api_gateway::observability::{logging, metrics};
use api_gateway::GatewayServer;

#[derive(Debug, Parser)]
#[command(name = "api-gateway", version, about = "Path-prefix API gateway")]
struct Cli {
    /// TOML configuration file; defaults plus environment are used without it.
    #[arg(short, long, env = "GATEWAY_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = loader::load(cli.config.as_deref())?;
    logging::init(&config.observability);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        bind_address = %config.listener.bind_address,
        routes = config.routes.len(),
        rate_limit_window_secs = config.rate_limit.window_secs,
        rate_limit_max_requests = config.rate_limit.max_requests,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let listener = Listener::bind(&config.listener).await?;
    let server = GatewayServer::new(config)?;

    let shutdown = Shutdown::new();
    let receiver = shutdown.subscribe();
    tokio::spawn(async move {
        wait_for_signal().await;
        shutdown.trigger();
    });

    server.run(listener, receiver).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
