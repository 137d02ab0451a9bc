//! Public request correlation.
//!
//! Bridges one blocking public HTTP request to one round-trip over the
//! owning session: parse the tunnel id, register a one-shot response slot,
//! emit a framed request, wait with a deadline, and map the outcome back
//! onto a public HTTP response.

use std::collections::HashMap;
use std::io::Read;

use axum::body::Body;
use axum::http::{HeaderName, HeaderValue, Request, Response, StatusCode};
use burrow_core::{header_value, is_websocket_upgrade, Frame, HttpRequest, HttpResponse, RequestId};
use tracing::{debug, error, warn};

use crate::server::Gateway;
use crate::session::PendingReply;

/// Response headers forwarded to the public client. Everything else is
/// dropped so internal or hop-by-hop headers never leak past the gateway.
const RESPONSE_HEADERS_KEPT: &[&str] = &[
    "content-type",
    "content-length",
    "set-cookie",
    "location",
    "cache-control",
    "expires",
    "etag",
    "last-modified",
    "vary",
    "x-request-id",
    "date",
    "server",
    "authorization",
];

/// Additionally forwarded when the response is a WebSocket upgrade.
const WEBSOCKET_HEADERS_KEPT: &[&str] = &[
    "connection",
    "upgrade",
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-protocol",
    "sec-websocket-extensions",
];

/// How a public URL failed to resolve to tunnel traffic.
#[derive(Debug, PartialEq)]
pub enum RouteError {
    /// The URL does not name a tunnel (or names one that cannot exist).
    NotFound(String),
    /// Path-mode URL of the wrong shape.
    Malformed(String),
}

/// Extract the tunnel id and the remaining path (query included) from a
/// public request, according to the configured routing mode.
pub fn extract_tunnel_route(
    use_subdomains: bool,
    host: &str,
    path: &str,
    query: Option<&str>,
) -> Result<(String, String), RouteError> {
    let with_query = |p: String| match query {
        Some(q) => format!("{}?{}", p, q),
        None => p,
    };

    if use_subdomains {
        let mut labels = host.split('.');
        let leftmost = labels.next().unwrap_or_default();
        if leftmost.is_empty() || labels.next().is_none() {
            return Err(RouteError::NotFound(format!("invalid host: {}", host)));
        }
        return Ok((leftmost.to_string(), with_query(path.to_string())));
    }

    let rest = if let Some(rest) = path.strip_prefix("/local/") {
        rest
    } else if path == "/local" {
        return Err(RouteError::Malformed(
            "invalid local tunnel path format".to_string(),
        ));
    } else {
        return Err(RouteError::NotFound(
            "tunnel not found: use a /local/{id} path".to_string(),
        ));
    };

    let mut segments = rest.splitn(2, '/');
    let tunnel_id = segments.next().unwrap_or_default();
    if tunnel_id.is_empty() {
        return Err(RouteError::Malformed(
            "invalid local tunnel path format".to_string(),
        ));
    }

    let remaining = match segments.next() {
        Some(tail) => format!("/{}", tail),
        None => String::new(),
    };

    Ok((tunnel_id.to_string(), with_query(remaining)))
}

/// Forward one public request through its tunnel and wait for the response.
pub async fn forward_public_request(
    gateway: &Gateway,
    host: &str,
    request: Request<Body>,
) -> Response<Body> {
    let uri = request.uri().clone();
    let route = extract_tunnel_route(
        gateway.config.use_subdomains,
        host,
        uri.path(),
        uri.query(),
    );

    let (tunnel_id, path) = match route {
        Ok(route) => route,
        Err(RouteError::Malformed(reason)) => {
            debug!("malformed tunnel url {}: {}", uri, reason);
            return error_response(StatusCode::BAD_REQUEST, &reason);
        }
        Err(RouteError::NotFound(reason)) => {
            debug!("no tunnel in url {}: {}", uri, reason);
            return error_response(StatusCode::NOT_FOUND, &reason);
        }
    };

    let tunnel = match gateway.registry.get_tunnel(&tunnel_id) {
        Some(tunnel) => tunnel,
        None => {
            debug!("tunnel {} not registered", tunnel_id);
            return error_response(
                StatusCode::NOT_FOUND,
                &format!("tunnel '{}' not found or not connected", tunnel_id),
            );
        }
    };

    let session = match gateway.registry.get_session(tunnel.session_id) {
        Some(session) => session,
        None => {
            // The owner died between lookup and send.
            return error_response(
                StatusCode::NOT_FOUND,
                &format!("tunnel '{}' not found or not connected", tunnel_id),
            );
        }
    };

    let method = request.method().as_str().to_string();

    // First value per name; repeated headers keep their first occurrence.
    let mut headers: HashMap<String, String> = HashMap::new();
    for (name, value) in request.headers() {
        if let Ok(value) = value.to_str() {
            headers
                .entry(name.as_str().to_string())
                .or_insert_with(|| value.to_string());
        }
    }

    let body = match axum::body::to_bytes(request.into_body(), gateway.config.body_limit).await {
        Ok(body) => body.to_vec(),
        Err(e) => {
            error!("failed to read request body: {}", e);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to read request body");
        }
    };

    let request_id = RequestId::new();
    debug!(
        "forwarding {} {} to tunnel {} (local port {}, request {})",
        method, path, tunnel_id, tunnel.local_port, request_id
    );

    // The slot must exist before the frame leaves the process, otherwise a
    // fast agent could answer into the void.
    let slot = session.register_pending(request_id);

    let frame = Frame::HttpRequest(HttpRequest {
        method,
        path,
        headers,
        body,
        request_id,
    });

    if session.send(frame).await.is_err() {
        session.remove_pending(request_id);
        error!("failed to forward request {} to session {}", request_id, session.id);
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to forward request");
    }

    gateway.registry.touch_tunnel(&tunnel_id);

    match tokio::time::timeout(gateway.config.request_deadline(), slot).await {
        Ok(Ok(PendingReply::Response(response))) => build_public_response(response),
        Ok(Ok(PendingReply::SessionTerminated)) | Ok(Err(_)) => {
            warn!("session {} ended while request {} was in flight", session.id, request_id);
            error_response(
                StatusCode::BAD_GATEWAY,
                "tunnel disconnected before a response arrived",
            )
        }
        Err(_) => {
            session.remove_pending(request_id);
            warn!("request {} to tunnel {} timed out", request_id, tunnel_id);
            error_response(StatusCode::GATEWAY_TIMEOUT, "Request timed out")
        }
    }
}

/// Map an agent response onto the public HTTP response: apply the header
/// allow-list and transparently decode gzip bodies.
fn build_public_response(data: HttpResponse) -> Response<Body> {
    let is_upgrade = is_websocket_upgrade(&data.headers);
    let gzipped = header_value(&data.headers, "content-encoding")
        .map(|v| v.to_ascii_lowercase().contains("gzip"))
        .unwrap_or(false);

    let body = if gzipped {
        match gunzip(&data.body) {
            Ok(decoded) => decoded,
            Err(e) => {
                error!("failed to decode gzipped response body: {}", e);
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
            }
        }
    } else {
        data.body
    };

    let status = StatusCode::from_u16(data.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = Response::builder().status(status);

    for (name, value) in &data.headers {
        let lower = name.to_ascii_lowercase();
        let kept = RESPONSE_HEADERS_KEPT.contains(&lower.as_str())
            || (is_upgrade && WEBSOCKET_HEADERS_KEPT.contains(&lower.as_str()));
        if !kept {
            continue;
        }
        // The advertised length no longer matches a decoded body.
        if gzipped && lower == "content-length" {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            builder = builder.header(name, value);
        }
    }

    builder.body(Body::from(body)).unwrap_or_else(|_| {
        error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to build response")
    })
}

fn gunzip(body: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = flate2::read::GzDecoder::new(body);
    let mut decoded = Vec::new();
    decoder.read_to_end(&mut decoded)?;
    Ok(decoded)
}

pub fn error_response(status: StatusCode, message: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain")
        .body(Body::from(message.to_string()))
        .unwrap_or_else(|_| {
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::from("Internal error"))
                .expect("static response")
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_core::RequestId;
    use std::io::Write;

    #[test]
    fn extracts_path_mode_routes() {
        let cases = [
            ("/local/abc123/path", None, "abc123", "/path"),
            ("/local/abc123", None, "abc123", ""),
            ("/local/abc123/a/b/c", None, "abc123", "/a/b/c"),
            ("/local/abc123/search", Some("q=rust"), "abc123", "/search?q=rust"),
        ];

        for (path, query, want_id, want_path) in cases {
            let (id, remaining) =
                extract_tunnel_route(false, "localhost:8001", path, query).unwrap();
            assert_eq!(id, want_id);
            assert_eq!(remaining, want_path);
        }
    }

    #[test]
    fn extracts_subdomain_routes() {
        let (id, path) =
            extract_tunnel_route(true, "abc123.domain:8001", "/path", None).unwrap();
        assert_eq!(id, "abc123");
        assert_eq!(path, "/path");

        let (id, path) = extract_tunnel_route(true, "abc123.domain:8001", "", None).unwrap();
        assert_eq!(id, "abc123");
        assert_eq!(path, "");
    }

    #[test]
    fn rejects_malformed_path_mode_routes() {
        assert!(matches!(
            extract_tunnel_route(false, "localhost", "/local/", None),
            Err(RouteError::Malformed(_))
        ));
        assert!(matches!(
            extract_tunnel_route(false, "localhost", "/local", None),
            Err(RouteError::Malformed(_))
        ));
        assert!(matches!(
            extract_tunnel_route(false, "localhost", "/dashboard", None),
            Err(RouteError::NotFound(_))
        ));
        assert!(matches!(
            extract_tunnel_route(false, "localhost", "/localfoo", None),
            Err(RouteError::NotFound(_))
        ));
    }

    #[test]
    fn rejects_bare_hosts_in_subdomain_mode() {
        assert!(matches!(
            extract_tunnel_route(true, "localhost", "/path", None),
            Err(RouteError::NotFound(_))
        ));
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    async fn body_bytes(response: Response<Body>) -> Vec<u8> {
        use http_body_util::BodyExt;
        response.into_body().collect().await.unwrap().to_bytes().to_vec()
    }

    #[tokio::test]
    async fn response_headers_are_filtered() {
        let data = HttpResponse {
            status_code: 200,
            headers: HashMap::from([
                ("Content-Type".to_string(), "text/html".to_string()),
                ("Set-Cookie".to_string(), "session=1".to_string()),
                ("X-Internal-Secret".to_string(), "hunter2".to_string()),
                ("Transfer-Encoding".to_string(), "chunked".to_string()),
            ]),
            body: b"<html>".to_vec(),
            request_id: RequestId::new(),
        };

        let response = build_public_response(data);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("content-type").unwrap(), "text/html");
        assert_eq!(response.headers().get("set-cookie").unwrap(), "session=1");
        assert!(response.headers().get("x-internal-secret").is_none());
        assert!(response.headers().get("transfer-encoding").is_none());
    }

    #[tokio::test]
    async fn gzipped_bodies_are_decoded_and_header_stripped() {
        let data = HttpResponse {
            status_code: 200,
            headers: HashMap::from([
                ("Content-Type".to_string(), "text/plain".to_string()),
                ("Content-Encoding".to_string(), "gzip".to_string()),
                ("Content-Length".to_string(), "26".to_string()),
            ]),
            body: gzip(b"Hello from local server"),
            request_id: RequestId::new(),
        };

        let response = build_public_response(data);
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("content-encoding").is_none());
        assert!(response.headers().get("content-length").is_none());
        assert_eq!(body_bytes(response).await, b"Hello from local server");
    }

    #[tokio::test]
    async fn corrupt_gzip_is_an_internal_error() {
        let data = HttpResponse {
            status_code: 200,
            headers: HashMap::from([("Content-Encoding".to_string(), "gzip".to_string())]),
            body: b"definitely not gzip".to_vec(),
            request_id: RequestId::new(),
        };

        let response = build_public_response(data);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn websocket_upgrade_keeps_upgrade_headers() {
        let data = HttpResponse {
            status_code: 101,
            headers: HashMap::from([
                ("Upgrade".to_string(), "websocket".to_string()),
                ("Connection".to_string(), "upgrade".to_string()),
                ("Sec-WebSocket-Accept".to_string(), "abc".to_string()),
            ]),
            body: Vec::new(),
            request_id: RequestId::new(),
        };

        let response = build_public_response(data);
        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(response.headers().get("upgrade").unwrap(), "websocket");
        assert_eq!(response.headers().get("connection").unwrap(), "upgrade");
        // Not on either allow-list.
        assert!(response.headers().get("sec-websocket-accept").is_none());
    }
}
