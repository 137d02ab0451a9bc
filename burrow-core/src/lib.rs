//! Core types and protocols for the burrow tunneling service.
//!
//! This crate provides the pieces shared between the gateway and the agent:
//! the wire protocol, the authentication seam, and the error taxonomy.

pub mod auth;
pub mod error;
pub mod frame;

pub use auth::{AccessToken, AuthError, HmacValidator, TokenValidator, DEFAULT_TOKEN_TTL_SECONDS};
pub use error::{ErrorCategory, TunnelError, TunnelResult};
pub use frame::{
    header_value, is_websocket_upgrade, ErrorInfo, Frame, HttpRequest, HttpResponse, RequestId,
    TunnelRequest, TunnelResponse,
};
