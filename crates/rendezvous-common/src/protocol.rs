use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorCode, SignalError};

/// Opaque rendezvous session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a client-supplied id. Anything that is not a UUID is simply an
    /// unknown session.
    pub fn parse(raw: &str) -> Option<Self> {
        Uuid::parse_str(raw.trim()).ok().map(Self)
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Participant identifier, unique within its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(Uuid);

impl ParticipantId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ParticipantId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Slot a participant occupies in a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    /// The other slot.
    pub fn peer(self) -> Role {
        match self {
            Role::Initiator => Role::Responder,
            Role::Responder => Role::Initiator,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Initiator => f.write_str("initiator"),
            Role::Responder => f.write_str("responder"),
        }
    }
}

/// Rendezvous session lifecycle.
///
/// States only ever move forward:
/// `AwaitingOffer -> AwaitingAnswer -> Connected -> {Failed, Expired}`.
/// `Failed` and `Expired` are terminal and may be entered from any live state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    AwaitingOffer,
    AwaitingAnswer,
    Connected,
    Failed,
    Expired,
}

impl SessionState {
    fn rank(self) -> u8 {
        match self {
            SessionState::AwaitingOffer => 0,
            SessionState::AwaitingAnswer => 1,
            SessionState::Connected => 2,
            SessionState::Failed | SessionState::Expired => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Failed | SessionState::Expired)
    }

    /// Whether moving from `self` to `next` respects the monotonic order.
    pub fn can_advance_to(self, next: SessionState) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Handshake message kinds relayed between participants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Offer,
    Answer,
    Candidate,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageKind::Offer => f.write_str("offer"),
            MessageKind::Answer => f.write_str("answer"),
            MessageKind::Candidate => f.write_str("candidate"),
        }
    }
}

/// `type` field of a client envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientMessageType {
    Join,
    Offer,
    Answer,
    Candidate,
    Bye,
}

/// Envelope sent by a participant to the gateway.
///
/// `sessionId` is kept as a raw string so an unparsable id is reported as an
/// unknown session rather than a malformed frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMessage {
    #[serde(rename = "type")]
    pub kind: ClientMessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
}

impl ClientMessage {
    /// `join` without a session id: create a new session.
    pub fn create() -> Self {
        Self::bare(ClientMessageType::Join, None)
    }

    /// `join` for an existing session.
    pub fn join(session_id: SessionId) -> Self {
        Self::bare(ClientMessageType::Join, Some(session_id))
    }

    pub fn handshake(
        kind: MessageKind,
        session_id: SessionId,
        payload: impl Into<String>,
        seq: u64,
    ) -> Self {
        let kind = match kind {
            MessageKind::Offer => ClientMessageType::Offer,
            MessageKind::Answer => ClientMessageType::Answer,
            MessageKind::Candidate => ClientMessageType::Candidate,
        };
        Self {
            payload: Some(payload.into()),
            seq: Some(seq),
            ..Self::bare(kind, Some(session_id))
        }
    }

    pub fn bye(session_id: SessionId) -> Self {
        Self::bare(ClientMessageType::Bye, Some(session_id))
    }

    fn bare(kind: ClientMessageType, session_id: Option<SessionId>) -> Self {
        Self {
            kind,
            session_id: session_id.map(|id| id.to_string()),
            payload: None,
            seq: None,
            role: None,
        }
    }
}

/// Frames sent by the gateway to a participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Admission succeeded.
    Joined {
        session_id: SessionId,
        participant_id: ParticipantId,
        role: Role,
    },
    /// The other slot was filled.
    PeerJoined { role: Role },
    /// Handshake message forwarded from the other participant.
    Relay {
        from: Role,
        kind: MessageKind,
        payload: String,
        seq: u64,
    },
    /// The other participant went away; the session has failed.
    PeerLeft { role: Role },
    /// Session ended without a peer departure (expiry, internal failure).
    Closed { state: SessionState },
    Error { code: ErrorCode, message: String },
}

impl From<&SignalError> for ServerMessage {
    fn from(err: &SignalError) -> Self {
        ServerMessage::Error {
            code: err.code(),
            message: err.to_string(),
        }
    }
}
