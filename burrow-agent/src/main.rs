//! Burrow Agent - developer-side tunnel client.
//!
//! Runs on the developer's machine and exposes a local port through a
//! burrow gateway.

mod config;
mod dispatcher;
mod event;
mod health;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use config::AgentConfig;
use event::LogObserver;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let config = AgentConfig::parse();

    let _ = FmtSubscriber::builder()
        .with_max_level(if config.debug {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .with_target(false)
        .try_init();

    info!("Starting burrow-agent v{}", env!("CARGO_PKG_VERSION"));
    info!("Gateway: {}", config.server);
    info!("Local port: {}", config.local_port);

    if config.verify_upstream {
        let addr = config.local_addr();
        match health::verify_upstream(&addr, 5).await {
            Ok(latency) => info!("local service on {} is reachable ({:?})", addr, latency),
            Err(e) => warn!(
                "local service on {} is not reachable yet: {}",
                addr, e
            ),
        }
    }

    let observer = Arc::new(LogObserver);
    dispatcher::run_loop(&config, observer).await
}
