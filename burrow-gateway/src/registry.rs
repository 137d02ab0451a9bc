//! Tunnel registry and liveness sweeping.
//!
//! The registry is the process-wide map from tunnel id to its owning
//! session. Tunnels hold the owning session's id, never the session itself;
//! every "send to the owning session" goes back through a registry lookup.

use std::sync::Arc;
use std::time::{Duration, Instant};

use burrow_core::{TunnelError, TunnelResult};
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::session::{PendingReply, Session, SessionId};

/// Attempts at drawing a fresh id before giving up on a collision storm.
const MAX_ID_ATTEMPTS: usize = 16;

/// A registered forwarding entry binding a public URL to one agent's local
/// port.
#[derive(Debug, Clone)]
pub struct Tunnel {
    pub id: String,
    pub local_port: u16,
    pub session_id: SessionId,
    pub public_url: String,
    pub created_at: Instant,
    pub last_activity_at: Instant,
}

/// Process-wide registry of tunnels and the sessions that own them.
#[derive(Default)]
pub struct Registry {
    tunnels: DashMap<String, Tunnel>,
    sessions: DashMap<SessionId, Arc<Session>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_session(&self, session: Arc<Session>) {
        self.sessions.insert(session.id, session);
    }

    pub fn get_session(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|entry| entry.clone())
    }

    /// Snapshot of the live sessions.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Allocate an id and insert a new tunnel for `session_id`.
    ///
    /// Ids are drawn uniformly from the configured alphabet; on collision a
    /// fresh id is drawn, up to a small bound. Exhausting the bound means
    /// the id space is effectively full, which is fatal.
    pub fn insert_tunnel(
        &self,
        session_id: SessionId,
        local_port: u16,
        config: &GatewayConfig,
    ) -> TunnelResult<Tunnel> {
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = generate_id(&config.id_alphabet, config.id_length);
            match self.tunnels.entry(id.clone()) {
                dashmap::mapref::entry::Entry::Occupied(_) => {
                    debug!("tunnel id collision on {}, retrying", id);
                    continue;
                }
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    let now = Instant::now();
                    let tunnel = Tunnel {
                        public_url: config.public_url(&id),
                        id,
                        local_port,
                        session_id,
                        created_at: now,
                        last_activity_at: now,
                    };
                    slot.insert(tunnel.clone());
                    return Ok(tunnel);
                }
            }
        }

        Err(TunnelError::internal(format!(
            "failed to allocate a tunnel id after {} attempts",
            MAX_ID_ATTEMPTS
        )))
    }

    pub fn get_tunnel(&self, id: &str) -> Option<Tunnel> {
        self.tunnels.get(id).map(|entry| entry.clone())
    }

    /// Record activity on a tunnel.
    pub fn touch_tunnel(&self, id: &str) {
        if let Some(mut tunnel) = self.tunnels.get_mut(id) {
            tunnel.last_activity_at = Instant::now();
        }
    }

    pub fn count(&self) -> usize {
        self.tunnels.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Tear a session down: remove its tunnels, wake every parked waiter
    /// with a terminal outcome, and forget the session. Idempotent; exactly
    /// one caller performs the cleanup.
    pub fn close_session(&self, session: &Session) {
        if !session.begin_close() {
            return;
        }

        let (tunnels, pending) = session.drain();
        let tunnel_count = tunnels.len();
        for tunnel_id in tunnels {
            self.tunnels.remove(&tunnel_id);
        }
        for (_, slot) in pending {
            let _ = slot.send(PendingReply::SessionTerminated);
        }

        self.sessions.remove(&session.id);
        session.mark_closed();

        info!(
            "session {} (user {}) closed, {} tunnel(s) removed, {} tunnel(s) remain",
            session.id,
            session.principal().unwrap_or_default(),
            tunnel_count,
            self.tunnels.len()
        );
    }

    /// One liveness pass: probe every session and tear down those whose
    /// writer is gone, dropping their tunnels with them. The maps are only
    /// iterated for a snapshot; probes and close actions run without any
    /// lock.
    pub fn sweep(&self) {
        debug!("running liveness sweep over {} tunnel(s)", self.tunnels.len());

        for session in self.sessions() {
            debug!(
                "probing session {} (idle for {:?})",
                session.id,
                session.last_activity().elapsed()
            );
            if !session.probe() {
                warn!("removing dead session {}", session.id);
                self.close_session(&session);
            }
        }

        // A tunnel must not outlive its session; sweep up any orphans.
        let orphans: Vec<Tunnel> = self
            .tunnels
            .iter()
            .filter(|entry| !self.sessions.contains_key(&entry.value().session_id))
            .map(|entry| entry.value().clone())
            .collect();
        for tunnel in orphans {
            warn!(
                "removing orphaned tunnel {} (created {:?} ago, last active {:?} ago)",
                tunnel.id,
                tunnel.created_at.elapsed(),
                tunnel.last_activity_at.elapsed()
            );
            self.tunnels.remove(&tunnel.id);
        }
    }
}

/// Spawn the registry sweeper, probing session liveness on a fixed cadence.
pub fn spawn_sweeper(registry: Arc<Registry>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // the first tick is immediate
        loop {
            ticker.tick().await;
            registry.sweep();
        }
    })
}

/// Generate a tunnel id from the given alphabet.
fn generate_id(alphabet: &str, length: usize) -> String {
    use rand::Rng;
    let chars: Vec<char> = alphabet.chars().collect();
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| chars[rng.gen_range(0..chars.len())])
        .collect()
}
