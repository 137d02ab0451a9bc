//! Agent configuration.

use clap::Parser;

/// Burrow Agent - expose a local port through a burrow gateway.
#[derive(Parser, Debug, Clone)]
#[command(name = "burrow-agent")]
#[command(author, version, about, long_about = None)]
pub struct AgentConfig {
    /// Gateway address (host:port, or a full http(s):///ws(s):// URL)
    #[arg(short, long, env = "BURROW_SERVER", default_value = "localhost:8001")]
    pub server: String,

    /// Local port to expose
    #[arg(short = 'p', long, env = "BURROW_LOCAL_PORT")]
    pub local_port: u16,

    /// Authentication token
    #[arg(short, long, env = "BURROW_TOKEN")]
    pub token: String,

    /// Reconnect delay in seconds
    #[arg(long, env = "BURROW_RECONNECT_DELAY", default_value = "5")]
    pub reconnect_delay: u64,

    /// Maximum reconnect attempts (0 = infinite)
    #[arg(long, env = "BURROW_MAX_RECONNECTS", default_value = "0")]
    pub max_reconnects: u32,

    /// Check that the local service is reachable before connecting
    #[arg(long, env = "BURROW_VERIFY_UPSTREAM")]
    pub verify_upstream: bool,

    /// Enable debug logging
    #[arg(long, env = "BURROW_DEBUG")]
    pub debug: bool,
}

impl AgentConfig {
    /// The WebSocket URL of the gateway's upgrade endpoint.
    pub fn ws_url(&self) -> String {
        let server = self.server.trim_end_matches('/');

        if server.starts_with("ws://") || server.starts_with("wss://") {
            return format!("{}/tunnel", server);
        }
        if let Some(rest) = server.strip_prefix("http://") {
            return format!("ws://{}/tunnel", rest);
        }
        if let Some(rest) = server.strip_prefix("https://") {
            return format!("wss://{}/tunnel", rest);
        }
        format!("ws://{}/tunnel", server)
    }

    /// The local address traffic is forwarded to.
    pub fn local_addr(&self) -> String {
        format!("127.0.0.1:{}", self.local_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(server: &str) -> AgentConfig {
        AgentConfig {
            server: server.to_string(),
            local_port: 3000,
            token: "test".to_string(),
            reconnect_delay: 5,
            max_reconnects: 0,
            verify_upstream: false,
            debug: false,
        }
    }

    #[test]
    fn ws_url_from_host_port() {
        assert_eq!(config("localhost:8001").ws_url(), "ws://localhost:8001/tunnel");
    }

    #[test]
    fn ws_url_from_http_urls() {
        assert_eq!(
            config("http://localhost:8001").ws_url(),
            "ws://localhost:8001/tunnel"
        );
        assert_eq!(
            config("https://burrow.example.com").ws_url(),
            "wss://burrow.example.com/tunnel"
        );
    }

    #[test]
    fn ws_url_passthrough() {
        assert_eq!(
            config("wss://burrow.example.com").ws_url(),
            "wss://burrow.example.com/tunnel"
        );
    }

    #[test]
    fn local_addr_uses_loopback() {
        assert_eq!(config("x").local_addr(), "127.0.0.1:3000");
    }
}
