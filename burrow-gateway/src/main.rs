//! Burrow Gateway - public tunnel endpoint.
//!
//! Runs on a public host, accepts agent control connections on `/tunnel`
//! and forwards public HTTP traffic into the matching tunnel.

mod config;
mod proxy;
mod registry;
mod server;
mod session;
mod shutdown;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use config::GatewayConfig;
use server::Gateway;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let config = GatewayConfig::parse();

    let _ = FmtSubscriber::builder()
        .with_max_level(if config.debug {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .with_target(false)
        .try_init();

    info!("Starting burrow-gateway v{}", env!("CARGO_PKG_VERSION"));
    info!("Base URL: {}", config.base_url);
    info!("Port: {}", config.port);
    info!(
        "Routing mode: {}",
        if config.use_subdomains {
            "subdomain"
        } else {
            "path (/local/{id})"
        }
    );

    let listen_addr = config.listen_addr();
    let sweep_interval = config.sweep_interval();
    let gateway = Arc::new(Gateway::new(config));

    let sweeper = registry::spawn_sweeper(gateway.registry.clone(), sweep_interval);

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    let serve = tokio::spawn(server::run(listener, gateway.clone()));

    shutdown::wait_for_signal().await;

    shutdown::drain(
        gateway.registry.clone(),
        Duration::from_secs(shutdown::DEFAULT_SHUTDOWN_TIMEOUT_SECS),
    )
    .await;

    sweeper.abort();
    serve.abort();
    info!("shutdown complete");
    Ok(())
}
