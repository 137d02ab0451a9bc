//! Graceful shutdown with session draining.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::registry::Registry;

/// Default shutdown timeout in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Wait for Ctrl+C or SIGTERM.
pub async fn wait_for_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, initiating graceful shutdown"),
        _ = terminate => info!("received SIGTERM, initiating graceful shutdown"),
    }
}

/// Administrative shutdown: close every session (waking their pending
/// waiters) and wait for the registry to empty out. Returns whether the
/// registry drained inside the timeout.
pub async fn drain(registry: Arc<Registry>, drain_timeout: Duration) -> bool {
    let sessions = registry.sessions();
    if !sessions.is_empty() {
        info!("draining {} active session(s)...", sessions.len());
    }
    for session in sessions {
        registry.close_session(&session);
    }

    let wait = async {
        loop {
            let sessions = registry.session_count();
            let tunnels = registry.count();
            if sessions == 0 && tunnels == 0 {
                return;
            }
            debug!(
                "waiting for {} session(s) and {} tunnel(s) to drain",
                sessions, tunnels
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    };

    match timeout(drain_timeout, wait).await {
        Ok(()) => {
            info!("all sessions drained");
            true
        }
        Err(_) => {
            warn!(
                "shutdown timeout reached with {} session(s) still active",
                registry.session_count()
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{PendingReply, Session};
    use burrow_core::RequestId;

    #[tokio::test]
    async fn drain_closes_sessions_and_wakes_waiters() {
        let registry = Arc::new(Registry::new());
        let (session, _rx) = Session::detached();
        registry.register_session(session.clone());
        let slot = session.register_pending(RequestId::new());

        let drained = drain(registry.clone(), Duration::from_secs(1)).await;
        assert!(drained);
        assert_eq!(registry.session_count(), 0);
        assert!(matches!(
            slot.await.unwrap(),
            PendingReply::SessionTerminated
        ));
    }

    #[tokio::test]
    async fn drain_of_an_empty_registry_is_immediate() {
        let registry = Arc::new(Registry::new());
        assert!(drain(registry, Duration::from_millis(100)).await);
    }
}
