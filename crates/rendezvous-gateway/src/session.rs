//! Rendezvous session state machine.
//!
//! A session moves through:
//! - AwaitingOffer: created by the initiator, no offer yet
//! - AwaitingAnswer: offer recorded, waiting for the responder's answer
//! - Connected: both descriptors exchanged
//! - Failed / Expired: terminal, reclaimed by the registry
//!
//! The state machine never performs I/O. Every operation returns [`Effects`]
//! describing which frames go to which channel; the gateway applies them while
//! it still holds the session lock, which keeps per-channel delivery FIFO.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use rendezvous_common::{
    MessageKind, ParticipantId, Role, ServerMessage, SessionId, SessionState, SignalError,
};
use tracing::{debug, warn};

use crate::channel::{CloseReason, RelayChannel};

/// Per-session limits, taken from the gateway configuration.
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    /// Buffered messages per absent participant.
    pub candidate_buffer: usize,
    pub max_descriptor_bytes: usize,
    pub max_candidate_bytes: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            candidate_buffer: 64,
            max_descriptor_bytes: 32 * 1024,
            max_candidate_bytes: 4096,
        }
    }
}

/// An accepted handshake message, stamped with the session sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeMessage {
    pub kind: MessageKind,
    pub from: Role,
    pub seq: u64,
    pub payload: String,
}

impl HandshakeMessage {
    fn to_relay(&self) -> ServerMessage {
        ServerMessage::Relay {
            from: self.from,
            kind: self.kind,
            payload: self.payload.clone(),
            seq: self.seq,
        }
    }
}

/// One frame to put on one participant's channel.
#[derive(Debug)]
pub struct Outgoing {
    pub to: Role,
    pub channel: RelayChannel,
    pub message: ServerMessage,
}

/// Side effects of a session operation, applied in order: deliveries first,
/// then channel closes.
#[derive(Debug, Default)]
pub struct Effects {
    pub deliveries: Vec<Outgoing>,
    pub close: Vec<(RelayChannel, CloseReason)>,
    /// Set when this operation moved the session into a terminal state.
    pub finished: bool,
}

impl Effects {
    pub fn is_empty(&self) -> bool {
        self.deliveries.is_empty() && self.close.is_empty() && !self.finished
    }

    fn merge(&mut self, other: Effects) {
        self.deliveries.extend(other.deliveries);
        self.close.extend(other.close);
        self.finished |= other.finished;
    }

    /// Deliver every frame in order, waiting on backpressure, then close.
    pub async fn apply(self) {
        for out in self.deliveries {
            if let Err(err) = out.channel.send(out.message).await {
                debug!(to = %out.to, "frame dropped: {}", err);
            }
        }
        for (channel, reason) in self.close {
            channel.close(reason);
        }
    }

    /// Like [`Effects::apply`] but never waits; a full channel is closed as
    /// stalled instead.
    pub fn apply_nonblocking(self) {
        for out in self.deliveries {
            if let Err(err) = out.channel.try_send(out.message) {
                debug!(to = %out.to, "frame dropped: {}", err);
            }
        }
        for (channel, reason) in self.close {
            channel.close(reason);
        }
    }
}

/// Result of admitting a participant.
#[derive(Debug)]
pub struct Admission {
    pub participant_id: ParticipantId,
    pub effects: Effects,
}

/// Per-participant state within a session.
#[derive(Debug)]
pub struct ParticipantSlot {
    pub id: ParticipantId,
    pub role: Role,
    /// Non-owning handle; cleared on disconnect.
    channel: Option<RelayChannel>,
    last_client_seq: Option<u64>,
}

impl ParticipantSlot {
    pub fn is_bound(&self) -> bool {
        self.channel.is_some()
    }
}

/// A rendezvous session between an initiator and a responder.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    state: SessionState,
    initiator: Option<ParticipantSlot>,
    responder: Option<ParticipantSlot>,
    /// Messages waiting for the initiator / responder to join.
    pending_initiator: VecDeque<HandshakeMessage>,
    pending_responder: VecDeque<HandshakeMessage>,
    next_seq: u64,
    limits: SessionLimits,
    created_at: Instant,
    last_activity: Instant,
}

impl Session {
    pub fn new(id: SessionId, limits: SessionLimits, now: Instant) -> Self {
        Self {
            id,
            state: SessionState::AwaitingOffer,
            initiator: None,
            responder: None,
            pending_initiator: VecDeque::new(),
            pending_responder: VecDeque::new(),
            next_seq: 0,
            limits,
            created_at: now,
            last_activity: now,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn participant(&self, role: Role) -> Option<&ParticipantSlot> {
        match role {
            Role::Initiator => self.initiator.as_ref(),
            Role::Responder => self.responder.as_ref(),
        }
    }

    /// Number of messages buffered for a participant that has not joined yet.
    pub fn pending_for(&self, role: Role) -> usize {
        match role {
            Role::Initiator => self.pending_initiator.len(),
            Role::Responder => self.pending_responder.len(),
        }
    }

    /// Bind a participant to the free `role` slot.
    ///
    /// The newcomer gets `joined`, then everything buffered for it in arrival
    /// order (including a recorded offer). A bound peer gets `peer_joined`.
    pub fn admit(
        &mut self,
        role: Role,
        channel: RelayChannel,
        now: Instant,
    ) -> Result<Admission, SignalError> {
        if self.state.is_terminal() {
            return Err(SignalError::not_joinable(format!(
                "session {} is {}",
                self.id, self.state
            )));
        }
        if self.participant(role).is_some() {
            return Err(SignalError::not_joinable(format!(
                "{} slot of session {} is taken",
                role, self.id
            )));
        }

        let participant_id = ParticipantId::new();
        let mut effects = Effects::default();

        effects.deliveries.push(Outgoing {
            to: role,
            channel: channel.clone(),
            message: ServerMessage::Joined {
                session_id: self.id,
                participant_id,
                role,
            },
        });
        for buffered in self.pending_mut(role).drain(..) {
            effects.deliveries.push(Outgoing {
                to: role,
                channel: channel.clone(),
                message: buffered.to_relay(),
            });
        }
        if let Some(peer) = self.bound_channel(role.peer()) {
            effects.deliveries.push(Outgoing {
                to: role.peer(),
                channel: peer,
                message: ServerMessage::PeerJoined { role },
            });
        }

        let slot = ParticipantSlot {
            id: participant_id,
            role,
            channel: Some(channel),
            last_client_seq: None,
        };
        match role {
            Role::Initiator => self.initiator = Some(slot),
            Role::Responder => self.responder = Some(slot),
        }
        self.last_activity = now;

        debug!(session_id = %self.id, %role, %participant_id, "participant admitted");
        Ok(Admission {
            participant_id,
            effects,
        })
    }

    /// Validate a handshake message against the current state, record it and
    /// route it to the other participant (or buffer it until they join).
    ///
    /// Rejections leave the session untouched.
    pub fn accept(
        &mut self,
        role: Role,
        participant_id: ParticipantId,
        kind: MessageKind,
        payload: String,
        client_seq: Option<u64>,
        now: Instant,
    ) -> Result<Effects, SignalError> {
        if self.state.is_terminal() {
            return Err(SignalError::ChannelClosed);
        }
        let last_client_seq = match self.participant(role) {
            Some(slot) if slot.id == participant_id && slot.is_bound() => slot.last_client_seq,
            _ => return Err(SignalError::ChannelClosed),
        };

        let next_state = match kind {
            MessageKind::Offer => {
                if role != Role::Initiator {
                    return Err(SignalError::protocol("only the initiator may send an offer"));
                }
                if self.state != SessionState::AwaitingOffer {
                    return Err(SignalError::protocol("offer already accepted"));
                }
                Some(SessionState::AwaitingAnswer)
            }
            MessageKind::Answer => {
                if role != Role::Responder {
                    return Err(SignalError::protocol("only the responder may send an answer"));
                }
                match self.state {
                    SessionState::AwaitingOffer => {
                        return Err(SignalError::protocol("answer before offer"));
                    }
                    SessionState::AwaitingAnswer => Some(SessionState::Connected),
                    _ => return Err(SignalError::protocol("answer already accepted")),
                }
            }
            MessageKind::Candidate => None,
        };

        let limit = match kind {
            MessageKind::Candidate => self.limits.max_candidate_bytes,
            MessageKind::Offer | MessageKind::Answer => self.limits.max_descriptor_bytes,
        };
        if kind != MessageKind::Candidate && payload.trim().is_empty() {
            return Err(SignalError::protocol(format!("empty {} descriptor", kind)));
        }
        if payload.len() > limit {
            return Err(SignalError::protocol(format!(
                "{} payload of {} bytes exceeds {} bytes",
                kind,
                payload.len(),
                limit
            )));
        }
        if let (Some(seq), Some(last)) = (client_seq, last_client_seq) {
            if seq <= last {
                return Err(SignalError::protocol(format!(
                    "sequence {} does not follow {}",
                    seq, last
                )));
            }
        }

        if let Some(next) = next_state {
            self.advance(next)?;
        }
        if let (Some(seq), Some(slot)) = (client_seq, self.slot_mut(role)) {
            slot.last_client_seq = Some(seq);
        }

        let message = HandshakeMessage {
            kind,
            from: role,
            seq: self.next_seq,
            payload,
        };
        self.next_seq += 1;
        self.last_activity = now;

        let mut effects = Effects::default();
        self.route(message, &mut effects);
        Ok(effects)
    }

    /// Unbind a participant. Before the session is terminal this fails it and
    /// tells the remaining participant, whose channel is then closed too.
    ///
    /// Safe to call more than once; later calls are no-ops.
    pub fn disconnect(&mut self, role: Role, participant_id: ParticipantId) -> Effects {
        let mut effects = Effects::default();
        let Some(slot) = self.slot_mut(role) else {
            return effects;
        };
        if slot.id != participant_id || slot.channel.take().is_none() {
            return effects;
        }

        if self.state.is_terminal() {
            return effects;
        }
        self.state = SessionState::Failed;
        effects.finished = true;

        if let Some(peer) = self.slot_mut(role.peer()).and_then(|slot| slot.channel.take()) {
            effects.deliveries.push(Outgoing {
                to: role.peer(),
                channel: peer.clone(),
                message: ServerMessage::PeerLeft { role },
            });
            effects.close.push((peer, CloseReason::SessionEnded));
        }
        debug!(session_id = %self.id, %role, "participant left, session failed");
        effects
    }

    /// Run the disconnect path for every participant whose channel was closed
    /// underneath the session, e.g. by a stalled send.
    pub fn release_closed_channels(&mut self) -> Effects {
        let mut effects = Effects::default();
        for role in [Role::Initiator, Role::Responder] {
            let dead = self.participant(role).and_then(|slot| match &slot.channel {
                Some(channel) if channel.is_closed() => Some(slot.id),
                _ => None,
            });
            if let Some(participant_id) = dead {
                warn!(session_id = %self.id, %role, "relay channel closed, releasing participant");
                effects.merge(self.disconnect(role, participant_id));
            }
        }
        effects
    }

    /// Expire the session if it is still mid-handshake and has been idle for
    /// at least `idle_timeout`.
    pub fn expire_if_idle(&mut self, now: Instant, idle_timeout: Duration) -> Option<Effects> {
        let in_handshake = matches!(
            self.state,
            SessionState::AwaitingOffer | SessionState::AwaitingAnswer
        );
        if !in_handshake || now.saturating_duration_since(self.last_activity) < idle_timeout {
            return None;
        }
        self.state = SessionState::Expired;
        Some(self.tear_down(CloseReason::SessionExpired))
    }

    /// Force the session into `Failed` after an internal invariant breach.
    pub fn fail(&mut self) -> Effects {
        if self.state.is_terminal() {
            return Effects::default();
        }
        self.state = SessionState::Failed;
        self.tear_down(CloseReason::SessionEnded)
    }

    fn tear_down(&mut self, reason: CloseReason) -> Effects {
        let mut effects = Effects {
            finished: true,
            ..Effects::default()
        };
        let state = self.state;
        for role in [Role::Initiator, Role::Responder] {
            if let Some(channel) = self.slot_mut(role).and_then(|slot| slot.channel.take()) {
                effects.deliveries.push(Outgoing {
                    to: role,
                    channel: channel.clone(),
                    message: ServerMessage::Closed { state },
                });
                effects.close.push((channel, reason));
            }
        }
        self.pending_initiator.clear();
        self.pending_responder.clear();
        effects
    }

    fn advance(&mut self, next: SessionState) -> Result<(), SignalError> {
        if !self.state.can_advance_to(next) {
            return Err(SignalError::internal(format!(
                "illegal transition {} -> {} in session {}",
                self.state, next, self.id
            )));
        }
        self.state = next;
        Ok(())
    }

    fn route(&mut self, message: HandshakeMessage, effects: &mut Effects) {
        let target = message.from.peer();
        if let Some(channel) = self.bound_channel(target) {
            effects.deliveries.push(Outgoing {
                to: target,
                channel,
                message: message.to_relay(),
            });
            return;
        }

        let capacity = self.limits.candidate_buffer;
        let session_id = self.id;
        let queue = self.pending_mut(target);
        if queue.len() >= capacity {
            // Descriptors are never evicted; drop the oldest candidate instead.
            match queue.iter().position(|m| m.kind == MessageKind::Candidate) {
                Some(index) => {
                    queue.remove(index);
                    warn!(%session_id, %target, "candidate buffer full, dropped oldest candidate");
                }
                None if message.kind == MessageKind::Candidate => {
                    warn!(%session_id, %target, "candidate buffer full, dropped candidate");
                    return;
                }
                None => {}
            }
        }
        queue.push_back(message);
    }

    fn bound_channel(&self, role: Role) -> Option<RelayChannel> {
        self.participant(role).and_then(|slot| slot.channel.clone())
    }

    fn slot_mut(&mut self, role: Role) -> Option<&mut ParticipantSlot> {
        match role {
            Role::Initiator => self.initiator.as_mut(),
            Role::Responder => self.responder.as_mut(),
        }
    }

    fn pending_mut(&mut self, role: Role) -> &mut VecDeque<HandshakeMessage> {
        match role {
            Role::Initiator => &mut self.pending_initiator,
            Role::Responder => &mut self.pending_responder,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Outbox;
    use rendezvous_common::ErrorCode;

    fn channel() -> (RelayChannel, Outbox) {
        RelayChannel::new(64, Duration::from_secs(1))
    }

    fn new_session() -> Session {
        Session::new(SessionId::new(), SessionLimits::default(), Instant::now())
    }

    fn messages_to(effects: &Effects, role: Role) -> Vec<ServerMessage> {
        effects
            .deliveries
            .iter()
            .filter(|d| d.to == role)
            .map(|d| d.message.clone())
            .collect()
    }

    fn relay(from: Role, kind: MessageKind, payload: &str, seq: u64) -> ServerMessage {
        ServerMessage::Relay {
            from,
            kind,
            payload: payload.to_string(),
            seq,
        }
    }

    #[test]
    fn test_full_handshake_reaches_connected() {
        let mut session = new_session();
        let now = Instant::now();
        let (init_tx, _init_rx) = channel();
        let (resp_tx, _resp_rx) = channel();

        let init = session.admit(Role::Initiator, init_tx, now).unwrap();
        assert!(matches!(
            messages_to(&init.effects, Role::Initiator).as_slice(),
            [ServerMessage::Joined { role: Role::Initiator, .. }]
        ));

        let effects = session
            .accept(Role::Initiator, init.participant_id, MessageKind::Offer, "O1".into(), Some(1), now)
            .unwrap();
        assert!(effects.deliveries.is_empty(), "offer is held until a responder joins");
        assert_eq!(session.state(), SessionState::AwaitingAnswer);

        let resp = session.admit(Role::Responder, resp_tx, now).unwrap();
        let to_responder = messages_to(&resp.effects, Role::Responder);
        assert!(matches!(to_responder[0], ServerMessage::Joined { role: Role::Responder, .. }));
        assert_eq!(to_responder[1], relay(Role::Initiator, MessageKind::Offer, "O1", 0));
        assert_eq!(
            messages_to(&resp.effects, Role::Initiator),
            vec![ServerMessage::PeerJoined { role: Role::Responder }]
        );

        let effects = session
            .accept(Role::Responder, resp.participant_id, MessageKind::Answer, "A1".into(), Some(1), now)
            .unwrap();
        assert_eq!(
            messages_to(&effects, Role::Initiator),
            vec![relay(Role::Responder, MessageKind::Answer, "A1", 1)]
        );
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[test]
    fn test_second_offer_is_rejected_without_state_change() {
        let mut session = new_session();
        let now = Instant::now();
        let (tx, _rx) = channel();
        let init = session.admit(Role::Initiator, tx, now).unwrap();
        session
            .accept(Role::Initiator, init.participant_id, MessageKind::Offer, "O1".into(), None, now)
            .unwrap();

        let err = session
            .accept(Role::Initiator, init.participant_id, MessageKind::Offer, "O2".into(), None, now)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProtocolViolation);
        assert_eq!(session.state(), SessionState::AwaitingAnswer);
        assert_eq!(session.pending_for(Role::Responder), 1);
    }

    #[test]
    fn test_answer_before_offer_is_rejected() {
        let mut session = new_session();
        let now = Instant::now();
        let (init_tx, _a) = channel();
        let (resp_tx, _b) = channel();
        let init = session.admit(Role::Initiator, init_tx, now).unwrap();
        let resp = session.admit(Role::Responder, resp_tx, now).unwrap();

        let err = session
            .accept(Role::Initiator, init.participant_id, MessageKind::Answer, "A".into(), None, now)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProtocolViolation);

        let err = session
            .accept(Role::Responder, resp.participant_id, MessageKind::Answer, "A".into(), None, now)
            .unwrap_err();
        assert_eq!(err, SignalError::protocol("answer before offer"));
        assert_eq!(session.state(), SessionState::AwaitingOffer);
    }

    #[test]
    fn test_responder_offer_and_duplicate_answer_are_rejected() {
        let mut session = new_session();
        let now = Instant::now();
        let (init_tx, _a) = channel();
        let (resp_tx, _b) = channel();
        let init = session.admit(Role::Initiator, init_tx, now).unwrap();
        let resp = session.admit(Role::Responder, resp_tx, now).unwrap();
        session
            .accept(Role::Initiator, init.participant_id, MessageKind::Offer, "O".into(), None, now)
            .unwrap();

        let err = session
            .accept(Role::Responder, resp.participant_id, MessageKind::Offer, "O".into(), None, now)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProtocolViolation);
        assert_eq!(session.state(), SessionState::AwaitingAnswer);

        session
            .accept(Role::Responder, resp.participant_id, MessageKind::Answer, "A".into(), None, now)
            .unwrap();
        let err = session
            .accept(Role::Responder, resp.participant_id, MessageKind::Answer, "A2".into(), None, now)
            .unwrap_err();
        assert_eq!(err, SignalError::protocol("answer already accepted"));
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[test]
    fn test_empty_and_oversized_descriptors_are_rejected() {
        let limits = SessionLimits {
            max_descriptor_bytes: 8,
            ..SessionLimits::default()
        };
        let mut session = Session::new(SessionId::new(), limits, Instant::now());
        let now = Instant::now();
        let (tx, _rx) = channel();
        let init = session.admit(Role::Initiator, tx, now).unwrap();

        for payload in ["", "   ", "0123456789"] {
            let err = session
                .accept(Role::Initiator, init.participant_id, MessageKind::Offer, payload.into(), None, now)
                .unwrap_err();
            assert_eq!(err.code(), ErrorCode::ProtocolViolation);
        }
        assert_eq!(session.state(), SessionState::AwaitingOffer);
    }

    #[test]
    fn test_client_sequence_must_increase() {
        let mut session = new_session();
        let now = Instant::now();
        let (tx, _rx) = channel();
        let init = session.admit(Role::Initiator, tx, now).unwrap();
        let id = init.participant_id;

        session
            .accept(Role::Initiator, id, MessageKind::Candidate, "c1".into(), Some(5), now)
            .unwrap();
        let err = session
            .accept(Role::Initiator, id, MessageKind::Candidate, "c2".into(), Some(5), now)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProtocolViolation);
        session
            .accept(Role::Initiator, id, MessageKind::Candidate, "c3".into(), None, now)
            .unwrap();
        session
            .accept(Role::Initiator, id, MessageKind::Candidate, "c4".into(), Some(6), now)
            .unwrap();
        assert_eq!(session.pending_for(Role::Responder), 3);
    }

    #[test]
    fn test_buffered_messages_flush_in_arrival_order() {
        let mut session = new_session();
        let now = Instant::now();
        let (init_tx, _a) = channel();
        let (resp_tx, _b) = channel();
        let init = session.admit(Role::Initiator, init_tx, now).unwrap();
        let id = init.participant_id;

        session
            .accept(Role::Initiator, id, MessageKind::Candidate, "c0".into(), None, now)
            .unwrap();
        session
            .accept(Role::Initiator, id, MessageKind::Offer, "O".into(), None, now)
            .unwrap();
        session
            .accept(Role::Initiator, id, MessageKind::Candidate, "c1".into(), None, now)
            .unwrap();

        let resp = session.admit(Role::Responder, resp_tx, now).unwrap();
        let to_responder = messages_to(&resp.effects, Role::Responder);
        assert_eq!(
            &to_responder[1..],
            &[
                relay(Role::Initiator, MessageKind::Candidate, "c0", 0),
                relay(Role::Initiator, MessageKind::Offer, "O", 1),
                relay(Role::Initiator, MessageKind::Candidate, "c1", 2),
            ]
        );
        assert_eq!(session.pending_for(Role::Responder), 0);
    }

    #[test]
    fn test_candidate_overflow_drops_oldest_but_keeps_offer() {
        let limits = SessionLimits {
            candidate_buffer: 3,
            ..SessionLimits::default()
        };
        let mut session = Session::new(SessionId::new(), limits, Instant::now());
        let now = Instant::now();
        let (init_tx, _a) = channel();
        let (resp_tx, _b) = channel();
        let id = session.admit(Role::Initiator, init_tx, now).unwrap().participant_id;

        session
            .accept(Role::Initiator, id, MessageKind::Offer, "O".into(), None, now)
            .unwrap();
        for n in 0..4 {
            session
                .accept(Role::Initiator, id, MessageKind::Candidate, format!("c{}", n), None, now)
                .unwrap();
        }
        assert_eq!(session.pending_for(Role::Responder), 3);

        let resp = session.admit(Role::Responder, resp_tx, now).unwrap();
        let payloads: Vec<String> = messages_to(&resp.effects, Role::Responder)
            .into_iter()
            .filter_map(|m| match m {
                ServerMessage::Relay { payload, .. } => Some(payload),
                _ => None,
            })
            .collect();
        assert_eq!(payloads, vec!["O", "c2", "c3"]);
    }

    #[test]
    fn test_second_responder_is_not_joinable() {
        let mut session = new_session();
        let now = Instant::now();
        let (a, _ra) = channel();
        let (b, _rb) = channel();
        let (c, _rc) = channel();
        session.admit(Role::Initiator, a, now).unwrap();
        session.admit(Role::Responder, b, now).unwrap();
        let err = session.admit(Role::Responder, c, now).unwrap_err();
        assert_eq!(err.code(), ErrorCode::SessionNotJoinable);
    }

    #[test]
    fn test_disconnect_in_connected_notifies_peer_once() {
        let mut session = new_session();
        let now = Instant::now();
        let (init_tx, _a) = channel();
        let (resp_tx, _b) = channel();
        let init = session.admit(Role::Initiator, init_tx, now).unwrap();
        let resp = session.admit(Role::Responder, resp_tx, now).unwrap();
        session
            .accept(Role::Initiator, init.participant_id, MessageKind::Offer, "O".into(), None, now)
            .unwrap();
        session
            .accept(Role::Responder, resp.participant_id, MessageKind::Answer, "A".into(), None, now)
            .unwrap();

        let effects = session.disconnect(Role::Responder, resp.participant_id);
        assert!(effects.finished);
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(
            messages_to(&effects, Role::Initiator),
            vec![ServerMessage::PeerLeft { role: Role::Responder }]
        );
        assert_eq!(effects.close.len(), 1);

        assert!(session.disconnect(Role::Responder, resp.participant_id).is_empty());
        assert!(session.disconnect(Role::Initiator, init.participant_id).is_empty());
    }

    #[test]
    fn test_disconnect_before_responder_fails_session() {
        let mut session = new_session();
        let now = Instant::now();
        let (tx, _rx) = channel();
        let init = session.admit(Role::Initiator, tx, now).unwrap();
        let effects = session.disconnect(Role::Initiator, init.participant_id);
        assert!(effects.finished);
        assert!(effects.deliveries.is_empty());
        assert_eq!(session.state(), SessionState::Failed);
        let (tx, _rx) = channel();
        assert_eq!(
            session.admit(Role::Responder, tx, now).unwrap_err().code(),
            ErrorCode::SessionNotJoinable
        );
    }

    #[test]
    fn test_messages_on_failed_session_report_closed_channel() {
        let mut session = new_session();
        let now = Instant::now();
        let (tx, _rx) = channel();
        let init = session.admit(Role::Initiator, tx, now).unwrap();
        session.fail();
        let err = session
            .accept(Role::Initiator, init.participant_id, MessageKind::Offer, "O".into(), None, now)
            .unwrap_err();
        assert_eq!(err, SignalError::ChannelClosed);
    }

    #[test]
    fn test_idle_expiry_only_mid_handshake() {
        let start = Instant::now();
        let mut session = Session::new(SessionId::new(), SessionLimits::default(), start);
        let (tx, _rx) = channel();
        session.admit(Role::Initiator, tx, start).unwrap();

        let timeout = Duration::from_secs(30);
        assert!(session.expire_if_idle(start + Duration::from_secs(10), timeout).is_none());

        let effects = session
            .expire_if_idle(start + Duration::from_secs(31), timeout)
            .expect("idle session should expire");
        assert!(effects.finished);
        assert_eq!(session.state(), SessionState::Expired);
        assert_eq!(
            messages_to(&effects, Role::Initiator),
            vec![ServerMessage::Closed { state: SessionState::Expired }]
        );
        assert!(session.expire_if_idle(start + Duration::from_secs(60), timeout).is_none());
    }

    #[test]
    fn test_connected_sessions_do_not_idle_out() {
        let start = Instant::now();
        let mut session = Session::new(SessionId::new(), SessionLimits::default(), start);
        let (a, _ra) = channel();
        let (b, _rb) = channel();
        let init = session.admit(Role::Initiator, a, start).unwrap();
        let resp = session.admit(Role::Responder, b, start).unwrap();
        session
            .accept(Role::Initiator, init.participant_id, MessageKind::Offer, "O".into(), None, start)
            .unwrap();
        session
            .accept(Role::Responder, resp.participant_id, MessageKind::Answer, "A".into(), None, start)
            .unwrap();
        assert!(session
            .expire_if_idle(start + Duration::from_secs(3600), Duration::from_secs(1))
            .is_none());
    }

    #[test]
    fn test_stalled_channel_fails_connected_session() {
        let now = Instant::now();
        let mut session = new_session();
        let (a, _ra) = channel();
        let (b, _rb) = channel();
        let init = session.admit(Role::Initiator, a.clone(), now).unwrap();
        let resp = session.admit(Role::Responder, b.clone(), now).unwrap();
        session
            .accept(Role::Initiator, init.participant_id, MessageKind::Offer, "O".into(), None, now)
            .unwrap();
        session
            .accept(Role::Responder, resp.participant_id, MessageKind::Answer, "A".into(), None, now)
            .unwrap();
        assert!(session.release_closed_channels().is_empty());

        b.close(CloseReason::Stalled);
        let effects = session.release_closed_channels();
        assert!(effects.finished);
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(
            messages_to(&effects, Role::Initiator),
            vec![ServerMessage::PeerLeft { role: Role::Responder }]
        );
        assert!(messages_to(&effects, Role::Responder).is_empty());
        assert_eq!(effects.close.len(), 1);
        assert!(!session.participant(Role::Responder).unwrap().is_bound());
        assert!(!session.participant(Role::Initiator).unwrap().is_bound());

        assert!(session.release_closed_channels().is_empty());
    }
}
