//! Duplex sessions between the gateway and connected agents.
//!
//! A session owns one authenticated WebSocket end-to-end: a writer task
//! serializes every outbound frame, a single receive loop dispatches inbound
//! frames by kind, and teardown returns the registry and every pending
//! waiter to a consistent state.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use burrow_core::{AuthError, Frame, HttpResponse, RequestId, TunnelError};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::server::Gateway;

/// Outbound frames buffered per session before senders start waiting.
const OUTBOUND_BUFFER: usize = 64;

/// Unique identifier for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Upgrade complete, bearer token not yet validated.
    Authenticating,
    /// Token accepted; tunnels and requests may flow.
    Active,
    /// A fatal condition was hit; cleanup is in progress.
    Closing,
    /// Cleanup complete.
    Closed,
}

/// How a pending request slot was resolved.
#[derive(Debug)]
pub enum PendingReply {
    /// The agent answered.
    Response(HttpResponse),
    /// The owning session was torn down while the waiter was parked.
    SessionTerminated,
}

struct Inner {
    state: SessionState,
    principal: Option<String>,
    tunnels: HashSet<String>,
    pending: HashMap<RequestId, oneshot::Sender<PendingReply>>,
}

/// One authenticated agent connection.
///
/// The pending-slot map and the owned-tunnel set share a single lock, held
/// only over in-memory operations.
pub struct Session {
    pub id: SessionId,
    outbound: mpsc::Sender<Frame>,
    inner: Mutex<Inner>,
    last_activity: Mutex<Instant>,
    closed_tx: watch::Sender<bool>,
}

impl Session {
    fn new(outbound: mpsc::Sender<Frame>) -> Self {
        Self {
            id: SessionId::new(),
            outbound,
            inner: Mutex::new(Inner {
                state: SessionState::Authenticating,
                principal: None,
                tunnels: HashSet::new(),
                pending: HashMap::new(),
            }),
            last_activity: Mutex::new(Instant::now()),
            closed_tx: watch::channel(false).0,
        }
    }

    /// Session constructor for unit tests: not wired to a socket.
    #[cfg(test)]
    pub fn detached() -> (Arc<Self>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let session = Arc::new(Self::new(tx));
        session.activate("test-user".to_string());
        (session, rx)
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().expect("session lock poisoned").state
    }

    pub fn principal(&self) -> Option<String> {
        self.inner
            .lock()
            .expect("session lock poisoned")
            .principal
            .clone()
    }

    fn activate(&self, principal: String) {
        let mut inner = self.inner.lock().expect("session lock poisoned");
        inner.state = SessionState::Active;
        inner.principal = Some(principal);
    }

    /// Queue a frame for the writer task. Safe to call from any number of
    /// producers; the single consumer keeps frames contiguous on the wire.
    pub async fn send(&self, frame: Frame) -> Result<(), TunnelError> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| TunnelError::transport("session writer is gone"))
    }

    /// Probe liveness without blocking: enqueue a ping if there is room.
    /// Returns false only when the writer has terminated; a full buffer
    /// means slow-but-alive.
    pub fn probe(&self) -> bool {
        match self.outbound.try_send(Frame::Ping) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn touch(&self) {
        *self.last_activity.lock().expect("session lock poisoned") = Instant::now();
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock().expect("session lock poisoned")
    }

    /// Register a one-shot delivery slot for a request id. Must be called
    /// before the matching `http_request` frame is sent. If the session is
    /// already going away the slot resolves immediately with
    /// [`PendingReply::SessionTerminated`].
    pub fn register_pending(&self, request_id: RequestId) -> oneshot::Receiver<PendingReply> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock().expect("session lock poisoned");
        match inner.state {
            SessionState::Closing | SessionState::Closed => {
                let _ = tx.send(PendingReply::SessionTerminated);
            }
            _ => {
                inner.pending.insert(request_id, tx);
            }
        }
        rx
    }

    /// Drop a slot without resolving it (deadline expiry, send failure).
    pub fn remove_pending(&self, request_id: RequestId) -> bool {
        self.inner
            .lock()
            .expect("session lock poisoned")
            .pending
            .remove(&request_id)
            .is_some()
    }

    /// Deliver a response to its waiter. Returns false when no slot exists,
    /// which is the late-response case: the caller drops the frame silently.
    pub fn resolve_pending(&self, response: HttpResponse) -> bool {
        let slot = self
            .inner
            .lock()
            .expect("session lock poisoned")
            .pending
            .remove(&response.request_id);
        match slot {
            Some(tx) => tx.send(PendingReply::Response(response)).is_ok(),
            None => false,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().expect("session lock poisoned").pending.len()
    }

    /// Record ownership of a tunnel.
    pub fn add_tunnel(&self, tunnel_id: &str) {
        self.inner
            .lock()
            .expect("session lock poisoned")
            .tunnels
            .insert(tunnel_id.to_string());
    }

    pub fn tunnel_count(&self) -> usize {
        self.inner.lock().expect("session lock poisoned").tunnels.len()
    }

    /// Transition to Closing. Returns true for exactly one caller, which is
    /// then responsible for cleanup.
    pub(crate) fn begin_close(&self) -> bool {
        let mut inner = self.inner.lock().expect("session lock poisoned");
        match inner.state {
            SessionState::Closing | SessionState::Closed => false,
            _ => {
                inner.state = SessionState::Closing;
                true
            }
        }
    }

    /// Take the owned tunnels and pending slots for cleanup.
    pub(crate) fn drain(
        &self,
    ) -> (
        HashSet<String>,
        HashMap<RequestId, oneshot::Sender<PendingReply>>,
    ) {
        let mut inner = self.inner.lock().expect("session lock poisoned");
        (
            std::mem::take(&mut inner.tunnels),
            std::mem::take(&mut inner.pending),
        )
    }

    pub(crate) fn mark_closed(&self) {
        self.inner.lock().expect("session lock poisoned").state = SessionState::Closed;
        let _ = self.closed_tx.send(true);
    }

    /// A watch that flips to true once the session is fully closed.
    pub fn closed_watch(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }
}

/// Drive one agent connection from upgrade to teardown.
pub async fn handle_session(socket: WebSocket, gateway: Arc<Gateway>, bearer: Option<String>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Authenticate before anything else. The failure reason is delivered as
    // exactly one error frame, then the stream is closed.
    let principal = match authenticate(&gateway, bearer.as_deref()) {
        Ok(principal) => principal,
        Err(reason) => {
            warn!("session authentication failed: {}", reason);
            if let Ok(bytes) = Frame::error(reason.to_string()).to_bytes() {
                let _ = ws_tx
                    .send(WsMessage::Text(String::from_utf8_lossy(&bytes).into_owned()))
                    .await;
            }
            let _ = ws_tx.close().await;
            return;
        }
    };

    let (out_tx, mut out_rx) = mpsc::channel::<Frame>(OUTBOUND_BUFFER);
    let session = Arc::new(Session::new(out_tx));
    session.activate(principal.clone());
    gateway.registry.register_session(session.clone());

    info!("session {} authenticated (user {})", session.id, principal);

    // Writer task: the only place frames touch the socket, so concurrent
    // senders can never interleave partial frames.
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let bytes = match frame.to_bytes() {
                Ok(bytes) => bytes,
                Err(e) => {
                    error!("failed to encode {} frame: {}", frame.kind(), e);
                    continue;
                }
            };
            let text = String::from_utf8_lossy(&bytes).into_owned();
            if ws_tx.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let mut closed = session.closed_watch();

    loop {
        let message = tokio::select! {
            message = ws_rx.next() => message,
            _ = closed.changed() => break,
        };

        let data = match message {
            Some(Ok(WsMessage::Text(text))) => text.into_bytes(),
            Some(Ok(WsMessage::Binary(data))) => data,
            Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => {
                session.touch();
                continue;
            }
            Some(Ok(WsMessage::Close(_))) => {
                info!("session {} closed by agent", session.id);
                break;
            }
            Some(Err(e)) => {
                info!("session {} transport error: {}", session.id, e);
                break;
            }
            None => {
                info!("session {} disconnected", session.id);
                break;
            }
        };

        let frame = match Frame::from_bytes(&data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("session {} sent an undecodable frame: {}", session.id, e);
                break;
            }
        };

        session.touch();
        if !dispatch_frame(&gateway, &session, frame).await {
            break;
        }
    }

    gateway.registry.close_session(&session);
    writer.abort();
    debug!("session {} is now {:?}", session.id, session.state());
}

fn authenticate(gateway: &Gateway, bearer: Option<&str>) -> Result<String, AuthError> {
    let token = bearer.ok_or(AuthError::NoToken)?;
    gateway.validator.validate(token)
}

/// Handle one frame in the Active state. Returns false when the session
/// must close.
async fn dispatch_frame(gateway: &Arc<Gateway>, session: &Arc<Session>, frame: Frame) -> bool {
    match frame {
        Frame::Ping => {
            debug!("session {} ping", session.id);
            session.send(Frame::Pong).await.is_ok()
        }
        Frame::Pong => {
            debug!("session {} pong", session.id);
            true
        }
        Frame::TunnelRequest(req) => {
            let tunnel = gateway
                .registry
                .insert_tunnel(session.id, req.local_port, &gateway.config)
                // Id-space exhaustion is the one process-fatal condition.
                .expect("tunnel id space exhausted");
            session.add_tunnel(&tunnel.id);

            info!(
                "new tunnel {} registered for session {} (local port {}, url {}, {} owned)",
                tunnel.id,
                session.id,
                req.local_port,
                tunnel.public_url,
                session.tunnel_count()
            );

            session
                .send(Frame::tunnel_response(tunnel.public_url))
                .await
                .is_ok()
        }
        Frame::HttpResponse(response) => {
            let request_id = response.request_id;
            if session.resolve_pending(response) {
                debug!(
                    "session {} resolved request {} ({} still pending)",
                    session.id,
                    request_id,
                    session.pending_count()
                );
            } else {
                // Late or duplicate response; the waiter is already gone.
                debug!(
                    "session {} dropped response for unknown request {}",
                    session.id, request_id
                );
            }
            true
        }
        Frame::Error(info) => {
            warn!("session {} sent error frame: {}", session.id, info.error);
            false
        }
        Frame::HttpRequest(_) | Frame::TunnelResponse(_) => {
            warn!(
                "session {} protocol violation: unexpected {} frame",
                session.id,
                frame.kind()
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    fn response(request_id: RequestId) -> HttpResponse {
        HttpResponse {
            status_code: 200,
            headers: StdHashMap::new(),
            body: b"ok".to_vec(),
            request_id,
        }
    }

    #[tokio::test]
    async fn pending_slot_resolves_once() {
        let (session, _rx) = Session::detached();
        let request_id = RequestId::new();

        let slot = session.register_pending(request_id);
        assert_eq!(session.pending_count(), 1);

        assert!(session.resolve_pending(response(request_id)));
        // A redundant response for the same id is discarded.
        assert!(!session.resolve_pending(response(request_id)));
        assert_eq!(session.pending_count(), 0);

        match slot.await.unwrap() {
            PendingReply::Response(resp) => assert_eq!(resp.status_code, 200),
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[tokio::test]
    async fn register_then_remove_restores_state() {
        let (session, _rx) = Session::detached();
        let request_id = RequestId::new();

        assert_eq!(session.pending_count(), 0);
        let _slot = session.register_pending(request_id);
        assert!(session.remove_pending(request_id));
        assert_eq!(session.pending_count(), 0);

        // Removing twice is a no-op.
        assert!(!session.remove_pending(request_id));
    }

    #[tokio::test]
    async fn teardown_resolves_waiters_with_termination() {
        let (session, _rx) = Session::detached();
        let slot_a = session.register_pending(RequestId::new());
        let slot_b = session.register_pending(RequestId::new());

        assert!(session.begin_close());
        let (_, pending) = session.drain();
        for (_, tx) in pending {
            let _ = tx.send(PendingReply::SessionTerminated);
        }
        session.mark_closed();

        assert!(matches!(
            slot_a.await.unwrap(),
            PendingReply::SessionTerminated
        ));
        assert!(matches!(
            slot_b.await.unwrap(),
            PendingReply::SessionTerminated
        ));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn registering_on_a_closing_session_resolves_immediately() {
        let (session, _rx) = Session::detached();
        assert!(session.begin_close());

        let slot = session.register_pending(RequestId::new());
        assert!(matches!(
            slot.await.unwrap(),
            PendingReply::SessionTerminated
        ));
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn begin_close_elects_a_single_cleaner() {
        let (session, _rx) = Session::detached();
        assert!(session.begin_close());
        assert!(!session.begin_close());
        assert_eq!(session.state(), SessionState::Closing);
    }

    #[tokio::test]
    async fn responses_match_their_own_waiters() {
        let (session, _rx) = Session::detached();
        let id_a = RequestId::new();
        let id_b = RequestId::new();

        let slot_a = session.register_pending(id_a);
        let slot_b = session.register_pending(id_b);

        // Deliver out of registration order.
        let mut resp_b = response(id_b);
        resp_b.status_code = 404;
        assert!(session.resolve_pending(resp_b));
        assert!(session.resolve_pending(response(id_a)));

        match slot_a.await.unwrap() {
            PendingReply::Response(resp) => assert_eq!(resp.request_id, id_a),
            other => panic!("unexpected reply: {:?}", other),
        }
        match slot_b.await.unwrap() {
            PendingReply::Response(resp) => {
                assert_eq!(resp.request_id, id_b);
                assert_eq!(resp.status_code, 404);
            }
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[tokio::test]
    async fn probe_reports_dead_writer() {
        let (session, rx) = Session::detached();
        assert!(session.probe());

        drop(rx);
        assert!(!session.probe());
    }
}
