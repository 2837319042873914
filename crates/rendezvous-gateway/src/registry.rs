//! Session registry: owns every live rendezvous session.
//!
//! The map is the only globally shared mutable structure in the gateway. Each
//! entry carries its own async mutex, so the registry lock is only held for
//! lookups, inserts and removals, never across a state transition.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rendezvous_common::{SessionId, SessionState, SignalError};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::session::{Session, SessionLimits};

pub type SessionRef = Arc<Mutex<Session>>;

#[derive(Debug, Default)]
struct Counters {
    created: AtomicU64,
    connected: AtomicU64,
    failed: AtomicU64,
    expired: AtomicU64,
    rejected: AtomicU64,
}

/// Point-in-time view of the registry, served by the health endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistrySnapshot {
    pub active_sessions: usize,
    pub awaiting_offer: usize,
    pub awaiting_answer: usize,
    pub connected: usize,
    pub sessions_created_total: u64,
    pub sessions_connected_total: u64,
    pub sessions_failed_total: u64,
    pub sessions_expired_total: u64,
    pub sessions_rejected_total: u64,
}

#[derive(Debug)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, SessionRef>>,
    max_sessions: usize,
    limits: SessionLimits,
    counters: Counters,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize, limits: SessionLimits) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions,
            limits,
            counters: Counters::default(),
        }
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// Allocate a new session in `AwaitingOffer`.
    pub async fn create_session(&self) -> Result<(SessionId, SessionRef), SignalError> {
        let mut guard = self.sessions.write().await;
        if guard.len() >= self.max_sessions {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(limit = self.max_sessions, "session capacity reached");
            return Err(SignalError::CapacityExceeded {
                limit: self.max_sessions,
            });
        }

        let mut id = SessionId::new();
        while guard.contains_key(&id) {
            id = SessionId::new();
        }
        let session = Arc::new(Mutex::new(Session::new(id, self.limits, Instant::now())));
        guard.insert(id, session.clone());
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        debug!(session_id = %id, "session created");
        Ok((id, session))
    }

    pub async fn get_session(&self, id: &SessionId) -> Option<SessionRef> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Drop a session from the map. Returns `None` if it was already gone.
    pub async fn remove_session(&self, id: &SessionId) -> Option<SessionRef> {
        let removed = self.sessions.write().await.remove(id);
        if removed.is_some() {
            debug!(session_id = %id, "session removed");
        }
        removed
    }

    /// Count a session outcome for the lifetime counters.
    pub fn record(&self, state: SessionState) {
        let counter = match state {
            SessionState::Connected => &self.counters.connected,
            SessionState::Failed => &self.counters.failed,
            SessionState::Expired => &self.counters.expired,
            SessionState::AwaitingOffer | SessionState::AwaitingAnswer => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Expire sessions that stayed mid-handshake for `idle_timeout`, notify
    /// their participants, and reclaim them together with any terminal
    /// session still lingering in the map. Participants whose relay channel
    /// was closed underneath them are released first, which fails their
    /// session. Returns how many were reclaimed.
    pub async fn expire_idle_sessions(&self, now: Instant, idle_timeout: Duration) -> usize {
        let candidates: Vec<(SessionId, SessionRef)> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(id, session)| (*id, session.clone()))
            .collect();

        let mut reclaim = Vec::new();
        for (id, session) in candidates {
            let mut guard = session.lock().await;
            let released = guard.release_closed_channels();
            if released.finished {
                self.record(SessionState::Failed);
                info!(session_id = %id, "relay channel closed, session failed");
            }
            released.apply_nonblocking();

            if let Some(effects) = guard.expire_if_idle(now, idle_timeout) {
                self.record(SessionState::Expired);
                info!(session_id = %id, "idle session expired");
                effects.apply_nonblocking();
                reclaim.push(id);
            } else if guard.state().is_terminal() {
                reclaim.push(id);
            }
        }

        if reclaim.is_empty() {
            return 0;
        }
        let mut guard = self.sessions.write().await;
        reclaim
            .into_iter()
            .filter(|id| guard.remove(id).is_some())
            .count()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn snapshot(&self) -> RegistrySnapshot {
        let sessions: Vec<SessionRef> = self.sessions.read().await.values().cloned().collect();
        let mut snapshot = RegistrySnapshot {
            active_sessions: sessions.len(),
            sessions_created_total: self.counters.created.load(Ordering::Relaxed),
            sessions_connected_total: self.counters.connected.load(Ordering::Relaxed),
            sessions_failed_total: self.counters.failed.load(Ordering::Relaxed),
            sessions_expired_total: self.counters.expired.load(Ordering::Relaxed),
            sessions_rejected_total: self.counters.rejected.load(Ordering::Relaxed),
            ..RegistrySnapshot::default()
        };
        for session in sessions {
            match session.lock().await.state() {
                SessionState::AwaitingOffer => snapshot.awaiting_offer += 1,
                SessionState::AwaitingAnswer => snapshot.awaiting_answer += 1,
                SessionState::Connected => snapshot.connected += 1,
                SessionState::Failed | SessionState::Expired => {}
            }
        }
        snapshot
    }
}
