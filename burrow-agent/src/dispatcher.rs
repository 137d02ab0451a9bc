//! Dispatch loop: turns framed requests from the gateway into local HTTP
//! calls and returns framed responses.
//!
//! One task reads frames; every `http_request` is handed to its own task so
//! a slow local call never blocks the others. Outbound frames funnel
//! through a single writer task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use burrow_core::{is_websocket_upgrade, Frame, HttpRequest, HttpResponse, RequestId};
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::Method;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;
use crate::event::{error_hint, Event, Observer, RequestEvent};

type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Request headers forwarded to the local service. Everything else is
/// dropped so fronting-proxy headers cannot confuse local servers.
const REQUEST_HEADERS_KEPT: &[&str] = &[
    "host",
    "user-agent",
    "accept",
    "accept-encoding",
    "accept-language",
    "content-type",
    "cookie",
    "x-forwarded-for",
    "x-forwarded-proto",
    "x-real-ip",
    "authorization",
];

/// Keepalive cadence towards the gateway.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Additionally forwarded when the request is a WebSocket upgrade.
const WEBSOCKET_HEADERS_KEPT: &[&str] = &[
    "connection",
    "upgrade",
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-protocol",
    "sec-websocket-extensions",
];

/// Run the tunnel with automatic reconnection.
pub async fn run_loop(config: &AgentConfig, observer: Arc<dyn Observer>) -> Result<()> {
    let mut attempts = 0u32;

    loop {
        attempts += 1;

        match run_session(config, observer.clone()).await {
            Ok(()) => {
                info!("tunnel closed gracefully");
                break;
            }
            Err(e) => {
                error!("tunnel error: {}", e);

                if config.max_reconnects > 0 && attempts >= config.max_reconnects {
                    error!("max reconnect attempts ({}) reached", config.max_reconnects);
                    return Err(e);
                }

                info!(
                    "reconnecting in {} seconds... (attempt {})",
                    config.reconnect_delay,
                    attempts + 1
                );
                tokio::time::sleep(Duration::from_secs(config.reconnect_delay)).await;
            }
        }
    }

    Ok(())
}

/// Run a single session: connect, obtain a tunnel, dispatch until the
/// stream ends.
async fn run_session(config: &AgentConfig, observer: Arc<dyn Observer>) -> Result<()> {
    let url = config.ws_url();
    info!("connecting to {}", url);

    // The bearer rides on the upgrade request itself.
    let mut request = url.into_client_request()?;
    request.headers_mut().insert(
        "Authorization",
        format!("Bearer {}", config.token)
            .parse()
            .context("token is not a valid header value")?,
    );

    let (ws_stream, _) = connect_async(request).await?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let (out_tx, mut out_rx) = mpsc::channel::<Frame>(64);

    // Writer task: the single place frames are written, so responses from
    // concurrent request tasks never interleave.
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    error!("failed to encode {} frame: {}", frame.kind(), e);
                    continue;
                }
            };
            if ws_tx.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    // Keepalive pings ride the same serialized writer.
    let heartbeat = tokio::spawn({
        let out_tx = out_tx.clone();
        async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.tick().await; // the first tick is immediate
            loop {
                ticker.tick().await;
                if out_tx.send(Frame::Ping).await.is_err() {
                    break;
                }
            }
        }
    });

    let result = drive_session(config, &observer, &mut ws_rx, &out_tx).await;

    heartbeat.abort();
    writer.abort();
    result
}

async fn drive_session(
    config: &AgentConfig,
    observer: &Arc<dyn Observer>,
    ws_rx: &mut WsReader,
    out_tx: &mpsc::Sender<Frame>,
) -> Result<()> {
    out_tx
        .send(Frame::tunnel_request(config.local_port))
        .await
        .map_err(|_| anyhow!("failed to send tunnel request"))?;

    // The gateway answers with the tunnel grant, or an error frame naming
    // the reason (bad token, for instance).
    let tunnel_url = loop {
        match read_frame(ws_rx).await? {
            Some(Frame::TunnelResponse(resp)) => break resp.url,
            Some(Frame::Error(info)) => bail!("failed to create tunnel: {}", info.error),
            Some(Frame::Ping) => {
                let _ = out_tx.send(Frame::Pong).await;
            }
            Some(other) => bail!("unexpected {} frame during tunnel setup", other.kind()),
            None => bail!("connection closed during tunnel setup"),
        }
    };

    info!("tunnel is live at {}", tunnel_url);
    info!("forwarding to http://{}", config.local_addr());

    let result = loop {
        let data = match ws_rx.next().await {
            Some(Ok(WsMessage::Text(text))) => text.into_bytes(),
            Some(Ok(WsMessage::Binary(data))) => data,
            Some(Ok(WsMessage::Close(_))) => break Ok(()),
            Some(Ok(_)) => continue,
            Some(Err(e)) => break Err(anyhow!("lost connection to gateway: {}", e)),
            None => break Err(anyhow!("lost connection to gateway: unexpected end of stream")),
        };

        let frame = match Frame::from_bytes(&data) {
            Ok(frame) => frame,
            Err(e) => break Err(anyhow!("undecodable frame from gateway: {}", e)),
        };

        match frame {
            Frame::HttpRequest(req) => {
                let local_port = config.local_port;
                let out_tx = out_tx.clone();
                let observer = observer.clone();
                let tunnel_url = tunnel_url.clone();
                tokio::spawn(async move {
                    handle_request(local_port, req, out_tx, observer, tunnel_url).await;
                });
            }
            Frame::Ping => {
                debug!("ping from gateway");
                if out_tx.send(Frame::Pong).await.is_err() {
                    break Err(anyhow!("writer is gone"));
                }
            }
            Frame::Pong => debug!("pong from gateway"),
            Frame::Error(info) => {
                observer.on_event(Event::Error(info.error.clone()));
                break Err(anyhow!("gateway error: {}", info.error));
            }
            Frame::TunnelRequest(_) | Frame::TunnelResponse(_) | Frame::HttpResponse(_) => {
                warn!("unexpected {} frame from gateway", frame.kind());
                break Err(anyhow!("protocol violation: {} frame", frame.kind()));
            }
        }
    };

    if let Err(ref e) = result {
        observer.on_event(Event::Request(RequestEvent::connection_lost(
            &tunnel_url,
            &e.to_string(),
        )));
    }

    result
}

/// Read the next frame, skipping transport-level messages. `None` means
/// the stream ended.
async fn read_frame(ws_rx: &mut WsReader) -> Result<Option<Frame>> {
    while let Some(message) = ws_rx.next().await {
        let data = match message? {
            WsMessage::Text(text) => text.into_bytes(),
            WsMessage::Binary(data) => data,
            WsMessage::Close(_) => return Ok(None),
            _ => continue,
        };
        return Ok(Some(Frame::from_bytes(&data)?));
    }
    Ok(None)
}

/// One request end-to-end: local round-trip, framed response, observation
/// event. Runs on its own task; the observer is invoked here, never on the
/// reader.
async fn handle_request(
    local_port: u16,
    request: HttpRequest,
    out_tx: mpsc::Sender<Frame>,
    observer: Arc<dyn Observer>,
    tunnel_url: String,
) {
    let started = Instant::now();
    let timestamp = SystemTime::now();
    let request_id = request.request_id;
    let method = request.method.clone();
    let path = request.path.clone();

    let response = match forward_local(local_port, &request).await {
        Ok(response) => response,
        Err(e) => {
            // A dead local server must not kill the session; answer for it.
            error!("failed to reach local service: {}", e);
            HttpResponse {
                status_code: 502,
                headers: HashMap::from([(
                    "Content-Type".to_string(),
                    "text/plain".to_string(),
                )]),
                body: format!("Failed to connect to local service: {}", e).into_bytes(),
                request_id,
            }
        }
    };

    let status = response.status_code;
    let hint = if status >= 400 {
        Some(error_hint(&response.body))
    } else {
        None
    };

    if out_tx.send(Frame::HttpResponse(response)).await.is_err() {
        error!("failed to queue response for request {}", request_id);
    }

    observer.on_event(Event::Request(RequestEvent {
        tunnel_url,
        method,
        path,
        status,
        duration: started.elapsed(),
        error: hint,
        timestamp,
        connection_failed: false,
    }));
}

/// Replay a framed request against `http://localhost:{local_port}{path}`.
/// Redirects are not followed; a 3xx comes back as-is.
async fn forward_local(local_port: u16, request: &HttpRequest) -> Result<HttpResponse> {
    let addr = format!("127.0.0.1:{}", local_port);
    debug!("forwarding {} {} to {}", request.method, request.path, addr);

    let stream = TcpStream::connect(&addr).await?;
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("local connection error: {}", e);
        }
    });

    let local_request = build_local_request(request, local_port)?;
    let response = sender.send_request(local_request).await?;
    read_local_response(response, request.request_id).await
}

fn build_local_request(
    request: &HttpRequest,
    local_port: u16,
) -> Result<hyper::Request<Full<Bytes>>> {
    let method = Method::from_bytes(request.method.as_bytes())?;

    let path = if request.path.is_empty() {
        "/".to_string()
    } else if request.path.starts_with('/') {
        request.path.clone()
    } else {
        format!("/{}", request.path)
    };

    let mut builder = hyper::Request::builder().method(method).uri(&path);

    let headers = filter_request_headers(&request.headers);
    let mut has_host = false;
    for (name, value) in &headers {
        if name.eq_ignore_ascii_case("host") {
            has_host = true;
        }
        builder = builder.header(name.as_str(), value.as_str());
    }
    if !has_host {
        builder = builder.header("Host", format!("localhost:{}", local_port));
    }

    Ok(builder.body(Full::new(Bytes::from(request.body.clone())))?)
}

/// Drop everything not on the request allow-list, keeping the WebSocket
/// family when the request is an upgrade.
pub(crate) fn filter_request_headers(headers: &HashMap<String, String>) -> HashMap<String, String> {
    let upgrade = is_websocket_upgrade(headers);
    headers
        .iter()
        .filter(|(name, _)| {
            let lower = name.to_ascii_lowercase();
            REQUEST_HEADERS_KEPT.contains(&lower.as_str())
                || (upgrade && WEBSOCKET_HEADERS_KEPT.contains(&lower.as_str()))
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

async fn read_local_response(
    response: hyper::Response<Incoming>,
    request_id: RequestId,
) -> Result<HttpResponse> {
    let status_code = response.status().as_u16();

    // First value per name, matching the wire format.
    let mut headers: HashMap<String, String> = HashMap::new();
    for (name, value) in response.headers() {
        if let Ok(value) = value.to_str() {
            headers
                .entry(name.as_str().to_string())
                .or_insert_with(|| value.to_string());
        }
    }

    let body = response.collect().await?.to_bytes().to_vec();

    Ok(HttpResponse {
        status_code,
        headers,
        body,
        request_id,
    })
}
