//! Observation events emitted by the dispatcher.

use std::time::{Duration, SystemTime};

use tracing::{error, info, warn};

/// One completed (or failed) round-trip through the tunnel.
#[derive(Debug, Clone)]
pub struct RequestEvent {
    /// Public URL of the tunnel the request arrived on.
    pub tunnel_url: String,
    pub method: String,
    pub path: String,
    pub status: u16,
    /// Wall-clock duration of the local round-trip.
    pub duration: Duration,
    /// For error statuses, a short prefix of the response body.
    pub error: Option<String>,
    pub timestamp: SystemTime,
    /// Set on the terminal event when the session's transport failed.
    pub connection_failed: bool,
}

impl RequestEvent {
    /// The terminal event emitted when the session is torn down.
    pub fn connection_lost(tunnel_url: &str, reason: &str) -> Self {
        Self {
            tunnel_url: tunnel_url.to_string(),
            method: String::new(),
            path: String::new(),
            status: 0,
            duration: Duration::ZERO,
            error: Some(reason.to_string()),
            timestamp: SystemTime::now(),
            connection_failed: true,
        }
    }
}

/// An event surfaced to the dispatcher's observer.
#[derive(Debug, Clone)]
pub enum Event {
    Request(RequestEvent),
    Error(String),
}

/// Receives dispatcher events. Delivery is best-effort: implementations
/// must return quickly and never block, since requests in flight share the
/// dispatcher's tasks.
pub trait Observer: Send + Sync {
    fn on_event(&self, event: Event);
}

/// Observer that writes events to the log.
#[derive(Default)]
pub struct LogObserver;

impl Observer for LogObserver {
    fn on_event(&self, event: Event) {
        match event {
            Event::Request(req) if req.connection_failed => {
                error!(
                    "lost connection to the gateway: {}",
                    req.error.as_deref().unwrap_or("unknown error")
                );
            }
            Event::Request(req) => {
                let duration_ms = req.duration.as_secs_f64() * 1000.0;
                match &req.error {
                    Some(hint) => warn!(
                        "{} {} -> {} ({:.1}ms) {}",
                        req.method, req.path, req.status, duration_ms, hint
                    ),
                    None => info!(
                        "{} {} -> {} ({:.1}ms)",
                        req.method, req.path, req.status, duration_ms
                    ),
                }
            }
            Event::Error(message) => error!("gateway error: {}", message),
        }
    }
}

/// Truncate an error body to a short display hint.
pub fn error_hint(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let mut hint: String = text.chars().take(30).collect();
    if text.chars().count() > 30 {
        hint.push_str("...");
    }
    hint
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_bodies_are_kept_whole() {
        assert_eq!(error_hint(b"not found"), "not found");
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = "x".repeat(100);
        let hint = error_hint(body.as_bytes());
        assert_eq!(hint, format!("{}...", "x".repeat(30)));
    }

    #[test]
    fn truncation_is_utf8_safe() {
        let body = "ü".repeat(40);
        let hint = error_hint(body.as_bytes());
        assert!(hint.starts_with('ü'));
        assert_eq!(hint.chars().count(), 33);
    }

    #[test]
    fn terminal_event_is_flagged() {
        let event = RequestEvent::connection_lost("http://x", "eof");
        assert!(event.connection_failed);
        assert_eq!(event.error.as_deref(), Some("eof"));
        assert_eq!(event.status, 0);
    }
}
