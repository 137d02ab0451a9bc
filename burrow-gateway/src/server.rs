//! Gateway state and public routing surface.
//!
//! One router serves three kinds of traffic: agent upgrade requests on
//! `/tunnel`, the health probe, and everything else as tunnel traffic
//! according to the configured routing mode.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Host, State};
use axum::http::{header, HeaderMap, Request, Response, StatusCode};
use axum::response::IntoResponse;
use axum::routing::any;
use axum::Router;
use burrow_core::{HmacValidator, TokenValidator};
use tracing::info;

use crate::config::GatewayConfig;
use crate::proxy;
use crate::registry::Registry;
use crate::session;

/// Everything the gateway needs, carried explicitly; no module-level state.
pub struct Gateway {
    pub config: GatewayConfig,
    pub registry: Arc<Registry>,
    pub validator: Arc<dyn TokenValidator>,
}

impl Gateway {
    /// Build a gateway from configuration, deriving the token validator
    /// from the configured secret (or generating one).
    pub fn new(config: GatewayConfig) -> Self {
        let validator = match config.auth_secret.as_deref() {
            Some(secret) => match HmacValidator::from_hex(secret) {
                Ok(validator) => validator,
                Err(_) => {
                    tracing::warn!("invalid auth secret, generating a new one");
                    HmacValidator::default()
                }
            },
            None => {
                let validator = HmacValidator::default();
                info!("Generated auth secret: {}", validator.secret_hex());
                info!("Use this secret to mint agent tokens");
                validator
            }
        };

        Self::with_validator(config, Arc::new(validator))
    }

    /// Build a gateway around an externally supplied validator.
    pub fn with_validator(config: GatewayConfig, validator: Arc<dyn TokenValidator>) -> Self {
        Self {
            config,
            registry: Arc::new(Registry::new()),
            validator,
        }
    }
}

/// Build the public router.
pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/tunnel", any(tunnel_handler))
        .fallback(root_handler)
        .with_state(gateway)
}

/// Run the gateway on an already bound listener.
pub async fn run(listener: tokio::net::TcpListener, gateway: Arc<Gateway>) -> anyhow::Result<()> {
    info!("gateway listening on {}", listener.local_addr()?);
    axum::serve(listener, router(gateway)).await?;
    Ok(())
}

/// The dedicated agent upgrade endpoint. Anything that is not a WebSocket
/// upgrade is a bad request.
async fn tunnel_handler(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Response<Body> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string);

    match ws {
        Some(ws) => ws
            .on_upgrade(move |socket| session::handle_session(socket, gateway, bearer))
            .into_response(),
        None => proxy::error_response(StatusCode::BAD_REQUEST, "WebSocket upgrade required"),
    }
}

/// Everything that is not `/tunnel`: tunnel traffic first, then the health
/// probe, then nothing.
async fn root_handler(
    State(gateway): State<Arc<Gateway>>,
    Host(host): Host,
    request: Request<Body>,
) -> Response<Body> {
    let path = request.uri().path().to_string();

    if gateway.config.use_subdomains && is_tunnel_host(&host) {
        return proxy::forward_public_request(&gateway, &host, request).await;
    }

    if !gateway.config.use_subdomains && path.starts_with("/local") {
        return proxy::forward_public_request(&gateway, &host, request).await;
    }

    if path == "/health" {
        return Response::builder()
            .status(StatusCode::OK)
            .body(Body::from("OK"))
            .expect("static response");
    }

    proxy::error_response(StatusCode::NOT_FOUND, "not found")
}

/// A host names a tunnel when it has more than two dot-labels and the
/// leftmost label is not `www`.
fn is_tunnel_host(host: &str) -> bool {
    let host = host.split(':').next().unwrap_or(host);
    let labels: Vec<&str> = host.split('.').collect();
    labels.len() > 2 && labels[0] != "www"
}
