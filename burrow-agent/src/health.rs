//! Reachability check for the local service.

use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::info;

/// Verify the local service accepts connections before the tunnel starts.
pub async fn verify_upstream(addr: &str, timeout_secs: u64) -> Result<Duration, String> {
    info!("verifying upstream connectivity to {}...", addr);
    let started = Instant::now();

    match timeout(Duration::from_secs(timeout_secs), TcpStream::connect(addr)).await {
        Ok(Ok(_stream)) => Ok(started.elapsed()),
        Ok(Err(e)) => Err(format!("connection failed: {}", e)),
        Err(_) => Err("connection timeout".to_string()),
    }
}
