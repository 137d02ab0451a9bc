//! Wire protocol for tunnel communication.
//!
//! Defines the framed messages exchanged between the agent and the gateway
//! over a single WebSocket connection. A frame is a self-describing JSON
//! object `{type, payload}`; bodies travel base64-encoded inside the payload.

use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier correlating an `http_request` frame with its
/// `http_response` frame. Unique within a session's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An HTTP request forwarded through the tunnel, gateway to agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequest {
    /// Method, preserved verbatim.
    pub method: String,
    /// Path including any query string.
    pub path: String,
    /// Headers collapsed to the first value per name.
    pub headers: HashMap<String, String>,
    #[serde(with = "base64_bytes")]
    pub body: Vec<u8>,
    pub request_id: RequestId,
}

/// An HTTP response returned through the tunnel, agent to gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    #[serde(with = "base64_bytes")]
    pub body: Vec<u8>,
    pub request_id: RequestId,
}

/// Payload of a `tunnel_req` frame: the local port the agent wants exposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelRequest {
    pub local_port: u16,
}

/// Payload of a `tunnel_resp` frame: the public URL assigned to the tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelResponse {
    pub url: String,
}

/// Payload of an `error` frame. Receipt is terminal for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub error: String,
}

/// A message exchanged on a session.
///
/// The payload variant is discriminated by the `type` tag, so a frame whose
/// kind and payload disagree cannot be represented.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Frame {
    Ping,
    Pong,
    #[serde(rename = "tunnel_req")]
    TunnelRequest(TunnelRequest),
    #[serde(rename = "tunnel_resp")]
    TunnelResponse(TunnelResponse),
    HttpRequest(HttpRequest),
    HttpResponse(HttpResponse),
    Error(ErrorInfo),
}

impl Frame {
    /// Create an error frame.
    pub fn error(message: impl Into<String>) -> Self {
        Frame::Error(ErrorInfo {
            error: message.into(),
        })
    }

    /// Create a tunnel request frame.
    pub fn tunnel_request(local_port: u16) -> Self {
        Frame::TunnelRequest(TunnelRequest { local_port })
    }

    /// Create a tunnel response frame.
    pub fn tunnel_response(url: impl Into<String>) -> Self {
        Frame::TunnelResponse(TunnelResponse { url: url.into() })
    }

    /// Short name of the frame kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Ping => "ping",
            Frame::Pong => "pong",
            Frame::TunnelRequest(_) => "tunnel_req",
            Frame::TunnelResponse(_) => "tunnel_resp",
            Frame::HttpRequest(_) => "http_request",
            Frame::HttpResponse(_) => "http_response",
            Frame::Error(_) => "error",
        }
    }

    /// Serialize to JSON bytes.
    pub fn to_bytes(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    /// Deserialize from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Look up a header by name, case-insensitively, in a first-value header map.
pub fn header_value<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Whether a header map describes a WebSocket upgrade.
pub fn is_websocket_upgrade(headers: &HashMap<String, String>) -> bool {
    let upgrade = header_value(headers, "upgrade")
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let connection = header_value(headers, "connection")
        .map(|v| v.split(',').any(|p| p.trim().eq_ignore_ascii_case("upgrade")))
        .unwrap_or(false);
    upgrade && connection
}

/// Module for base64 encoding/decoding of byte vectors in serde.
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}
