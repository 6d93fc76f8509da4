//! Edge proxy
//!
//! # Architecture Overview
//!
//! ```text
//!                  ┌──────────────────────────────────────────────────────────┐
//!                  │                        EDGE PROXY                        │
//!                  │                                                          │
//!   Client bytes   │  ┌─────────┐   ┌──────────────┐   ┌──────────────────┐  │
//!  ────────────────┼─▶│   net   │──▶│  http h1/h2  │──▶│  proxy::forward  │  │
//!                  │  │listener │   │ codec+stream │   │  route + retry   │  │
//!                  │  └─────────┘   └──────────────┘   └────────┬─────────┘  │
//!                  │                                            │            │
//!                  │                                            ▼            │
//!   Client bytes   │                ┌──────────────┐   ┌──────────────────┐  │   Upstream
//!  ◀───────────────┼────────────────│ reply encode │◀──│ upstream cluster │◀─┼── hosts
//!                  │                └──────────────┘   │  + conn pool     │  │
//!                  │                                   └──────────────────┘  │
//!                  │   config · lifecycle (drain/shutdown) · observability     │
//!                  └──────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use edge_proxy::config::{load_config, ProxyConfig};
use edge_proxy::observability::logging;
use edge_proxy::upstream::TcpConnector;
use edge_proxy::{HttpServer, Shutdown};

#[derive(Debug, Parser)]
#[command(name = "edge-proxy", version, about = "HTTP/1 and HTTP/2 edge proxy")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };
    logging::init(&config.observability.log_level);

    tracing::info!(
        listeners = config.listeners.len(),
        clusters = config.clusters.len(),
        routes = config.routes.len(),
        "Configuration loaded"
    );

    let server = HttpServer::bind(&config, Arc::new(TcpConnector)).await?;
    let shutdown = Shutdown::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            return;
        }
        tracing::info!("Shutdown signal received");
        signal.trigger();
    });

    server.run(shutdown).await?;
    tracing::info!("Shutdown complete");
    Ok(())
}
