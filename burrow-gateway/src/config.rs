//! Gateway configuration.

use std::time::Duration;

use clap::Parser;

/// Default tunnel id alphabet: lowercase alphanumerics with the easily
/// confused characters (i, l, o, 0, 1) removed.
pub const DEFAULT_ID_ALPHABET: &str = "abcdefghjkmnpqrstuvwxyz23456789";

/// Burrow Gateway - expose local ports to the public internet.
#[derive(Parser, Debug, Clone)]
#[command(name = "burrow-gateway")]
#[command(author, version, about, long_about = None)]
pub struct GatewayConfig {
    /// Base URL of the gateway (e.g. http://localhost or https://burrow.example.com)
    #[arg(long, env = "BURROW_BASE_URL", default_value = "http://localhost")]
    pub base_url: String,

    /// Port for public traffic and agent control connections
    #[arg(long, env = "BURROW_PORT", default_value = "8001")]
    pub port: u16,

    /// Route tunnels by subdomain instead of /local/{id} paths
    #[arg(long, env = "BURROW_USE_SUBDOMAINS")]
    pub use_subdomains: bool,

    /// Milliseconds a public request may wait for the agent's response
    #[arg(long, env = "BURROW_REQUEST_DEADLINE_MS", default_value = "30000")]
    pub request_deadline_ms: u64,

    /// Seconds between liveness sweeps of the tunnel registry
    #[arg(long, env = "BURROW_LIVENESS_INTERVAL", default_value = "60")]
    pub liveness_interval: u64,

    /// Number of characters in a tunnel id
    #[arg(long, env = "BURROW_ID_LENGTH", default_value = "8")]
    pub id_length: usize,

    /// Alphabet tunnel ids are drawn from
    #[arg(long, env = "BURROW_ID_ALPHABET", default_value = DEFAULT_ID_ALPHABET)]
    pub id_alphabet: String,

    /// Authentication secret (hex-encoded, 32 bytes)
    /// If not provided, a random secret will be generated
    #[arg(long, env = "BURROW_AUTH_SECRET")]
    pub auth_secret: Option<String>,

    /// Maximum buffered request body size in bytes
    #[arg(long, env = "BURROW_BODY_LIMIT", default_value = "10485760")]
    pub body_limit: usize,

    /// Enable debug logging
    #[arg(long, env = "BURROW_DEBUG")]
    pub debug: bool,
}

impl GatewayConfig {
    /// The address the gateway listens on.
    pub fn listen_addr(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }

    /// Per-public-request response deadline.
    pub fn request_deadline(&self) -> Duration {
        Duration::from_millis(self.request_deadline_ms)
    }

    /// Registry sweep cadence.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_interval)
    }

    /// The public URL a tunnel is reachable at.
    ///
    /// Path mode keeps the configured scheme and appends `/local/{id}`; the
    /// port is included for plain HTTP, omitted for HTTPS. Subdomain mode
    /// prefixes the id as a host label and always serves HTTPS.
    pub fn public_url(&self, id: &str) -> String {
        if !self.use_subdomains {
            let base = self.base_url.trim_end_matches('/');
            if base.starts_with("http://") {
                return format!("{}:{}/local/{}", base, self.port, id);
            }
            return format!("{}/local/{}", base, id);
        }

        let host = self
            .base_url
            .trim_end_matches('/')
            .trim_start_matches("https://")
            .trim_start_matches("http://");
        format!("https://{}.{}", id, host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base_url: &str, port: u16, use_subdomains: bool) -> GatewayConfig {
        GatewayConfig {
            base_url: base_url.to_string(),
            port,
            use_subdomains,
            request_deadline_ms: 30_000,
            liveness_interval: 60,
            id_length: 8,
            id_alphabet: DEFAULT_ID_ALPHABET.to_string(),
            auth_secret: None,
            body_limit: 10 * 1024 * 1024,
            debug: false,
        }
    }

    #[test]
    fn public_url_path_mode_with_port() {
        let cfg = config("http://localhost", 8001, false);
        assert_eq!(
            cfg.public_url("abc123"),
            "http://localhost:8001/local/abc123"
        );
    }

    #[test]
    fn public_url_path_mode_https_omits_port() {
        let cfg = config("https://burrow.example.com", 8001, false);
        assert_eq!(
            cfg.public_url("abc123"),
            "https://burrow.example.com/local/abc123"
        );
    }

    #[test]
    fn public_url_subdomain_mode() {
        let cfg = config("https://burrow.example.com", 8001, true);
        assert_eq!(
            cfg.public_url("abc123"),
            "https://abc123.burrow.example.com"
        );
    }
}
