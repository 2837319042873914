//! Transport-agnostic gateway core.
//!
//! A transport opens a [`RelayChannel`], hands it to [`Gateway::connect`] with
//! the participant's `join`, and then feeds every later client message to the
//! returned [`ParticipantHandle`]. Dropping or closing the handle tells the
//! session the participant has gone.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use rendezvous_common::{
    ClientMessage, ClientMessageType, MessageKind, ParticipantId, Role, ServerMessage,
    SessionId, SessionState, SignalError,
};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::channel::{CloseReason, Outbox, RelayChannel};
use crate::config::GatewayConfig;
use crate::registry::{SessionRef, SessionRegistry};
use crate::session::{Effects, Session};

#[derive(Debug, Clone)]
pub struct Gateway {
    registry: Arc<SessionRegistry>,
    config: Arc<GatewayConfig>,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Self {
        let registry = SessionRegistry::new(config.max_sessions, config.session_limits());
        Self {
            registry: Arc::new(registry),
            config: Arc::new(config),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// A fresh relay channel sized from the configuration.
    pub fn open_channel(&self) -> (RelayChannel, Outbox) {
        RelayChannel::new(self.config.outbox_capacity, self.config.send_timeout)
    }

    /// Admit a participant.
    ///
    /// Without a session id a new session is created and the caller becomes
    /// its initiator; with one the caller joins that session as responder.
    /// `role` is an optional hint and must agree with that rule.
    pub async fn connect(
        &self,
        session_id: Option<SessionId>,
        role: Option<Role>,
        channel: RelayChannel,
    ) -> Result<ParticipantHandle, SignalError> {
        let (session_id, session, role, created) = match session_id {
            None => {
                if role == Some(Role::Responder) {
                    return Err(SignalError::not_joinable(
                        "a responder must name the session to join",
                    ));
                }
                let (id, session) = self.registry.create_session().await?;
                (id, session, Role::Initiator, true)
            }
            Some(id) => {
                if role == Some(Role::Initiator) {
                    return Err(SignalError::not_joinable(format!(
                        "initiator slot of session {} is taken",
                        id
                    )));
                }
                let session = self
                    .registry
                    .get_session(&id)
                    .await
                    .ok_or_else(|| SignalError::not_joinable(format!("unknown session {}", id)))?;
                (id, session, Role::Responder, false)
            }
        };

        let mut guard = session.lock().await;
        let admission = match guard.admit(role, channel.clone(), Instant::now()) {
            Ok(admission) => admission,
            Err(err) => {
                drop(guard);
                if created {
                    self.registry.remove_session(&session_id).await;
                }
                return Err(err);
            }
        };
        let finished = settle(&mut guard, admission.effects).await;
        drop(guard);

        info!(%session_id, %role, participant_id = %admission.participant_id, "participant joined");
        if finished {
            self.registry.record(SessionState::Failed);
            self.registry.remove_session(&session_id).await;
        }
        Ok(ParticipantHandle {
            gateway: self.clone(),
            session,
            session_id,
            participant_id: admission.participant_id,
            role,
            channel,
            released: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Periodically expire idle handshakes and reclaim finished sessions.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let gateway = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(gateway.config.sweep_interval);
            loop {
                interval.tick().await;
                let reclaimed = gateway
                    .registry
                    .expire_idle_sessions(Instant::now(), gateway.config.idle_timeout)
                    .await;
                if reclaimed > 0 {
                    debug!("reclaimed {} sessions", reclaimed);
                }
            }
        })
    }
}

/// A participant bound to a session slot.
#[derive(Debug)]
pub struct ParticipantHandle {
    gateway: Gateway,
    session: SessionRef,
    session_id: SessionId,
    participant_id: ParticipantId,
    role: Role,
    channel: RelayChannel,
    /// Set once the session has been told about the departure.
    released: Arc<AtomicBool>,
}

impl ParticipantHandle {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn participant_id(&self) -> ParticipantId {
        self.participant_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn channel(&self) -> &RelayChannel {
        &self.channel
    }

    /// Process one client message. Rejections are reported to this
    /// participant as an `error` frame and returned.
    pub async fn on_message(&self, message: ClientMessage) -> Result<(), SignalError> {
        let result = self.dispatch(message).await;
        if let Err(err) = &result {
            debug!(session_id = %self.session_id, role = %self.role, "message rejected: {}", err);
            let _ = self.channel.send(ServerMessage::from(err)).await;
        }
        result
    }

    async fn dispatch(&self, message: ClientMessage) -> Result<(), SignalError> {
        if self.released.load(Ordering::Acquire) {
            return Err(SignalError::ChannelClosed);
        }
        // `None` is a bye.
        let kind = match message.kind {
            ClientMessageType::Join => {
                return Err(SignalError::protocol("connection already joined a session"));
            }
            ClientMessageType::Bye => None,
            ClientMessageType::Offer => Some(MessageKind::Offer),
            ClientMessageType::Answer => Some(MessageKind::Answer),
            ClientMessageType::Candidate => Some(MessageKind::Candidate),
        };

        match message.session_id.as_deref() {
            None => return Err(SignalError::protocol("sessionId is required")),
            Some(raw) if SessionId::parse(raw) != Some(self.session_id) => {
                return Err(SignalError::protocol(format!(
                    "connection is bound to session {}",
                    self.session_id
                )));
            }
            Some(_) => {}
        }

        let Some(kind) = kind else {
            self.close(CloseReason::Bye).await;
            return Ok(());
        };

        let payload = message.payload.unwrap_or_default();
        let mut session = self.session.lock().await;
        let before = session.state();
        match session.accept(
            self.role,
            self.participant_id,
            kind,
            payload,
            message.seq,
            Instant::now(),
        ) {
            Ok(effects) => {
                let after = session.state();
                let finished = settle(&mut session, effects).await;
                drop(session);
                if after != before {
                    debug!(session_id = %self.session_id, "{} -> {}", before, after);
                    if after == SessionState::Connected {
                        self.gateway.registry.record(after);
                        info!(session_id = %self.session_id, "session connected");
                    }
                }
                if finished {
                    self.gateway.registry.record(SessionState::Failed);
                    info!(session_id = %self.session_id, "relay stalled, session failed");
                    self.gateway.registry.remove_session(&self.session_id).await;
                }
                Ok(())
            }
            Err(SignalError::Internal(detail)) => {
                error!(session_id = %self.session_id, "session invariant broken: {}", detail);
                let effects = session.fail();
                let finished = settle(&mut session, effects).await;
                drop(session);
                if finished {
                    self.gateway.registry.record(SessionState::Failed);
                }
                self.gateway.registry.remove_session(&self.session_id).await;
                Err(SignalError::Internal(detail))
            }
            Err(err) => Err(err),
        }
    }

    /// Close this participant's channel and release its slot. Only the first
    /// call reaches the session.
    pub async fn close(&self, reason: CloseReason) {
        self.channel.close(reason);
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        release(
            self.gateway.clone(),
            self.session.clone(),
            self.session_id,
            self.role,
            self.participant_id,
            reason,
        )
        .await;
    }
}

impl Drop for ParticipantHandle {
    fn drop(&mut self) {
        self.channel.close(CloseReason::Disconnected);
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(release(
                self.gateway.clone(),
                self.session.clone(),
                self.session_id,
                self.role,
                self.participant_id,
                CloseReason::Disconnected,
            ));
        }
    }
}

async fn release(
    gateway: Gateway,
    session: SessionRef,
    session_id: SessionId,
    role: Role,
    participant_id: ParticipantId,
    reason: CloseReason,
) {
    let mut guard = session.lock().await;
    let effects = guard.disconnect(role, participant_id);
    let finished = settle(&mut guard, effects).await;
    let state = guard.state();
    drop(guard);

    if finished {
        gateway.registry.record(state);
        info!(%session_id, %role, %reason, "participant left, session {}", state);
    } else {
        debug!(%session_id, %role, %reason, "participant released");
    }
    if state.is_terminal() {
        gateway.registry.remove_session(&session_id).await;
    }
}

/// Apply `effects`, then release any participant whose channel closed while
/// frames were being delivered. Must run under the session lock. Returns true
/// when the session became terminal along the way.
async fn settle(session: &mut Session, effects: Effects) -> bool {
    let mut finished = effects.finished;
    effects.apply().await;
    loop {
        let reaped = session.release_closed_channels();
        if reaped.is_empty() {
            return finished;
        }
        finished |= reaped.finished;
        reaped.apply().await;
    }
}
