//! Handshake driver for one side of a rendezvous session.

use rendezvous_common::{
    ClientMessage, ErrorCode, MessageKind, Role, ServerMessage, SessionId, SessionState,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

use crate::engine::{DescriptorEngine, EngineEvent};
use crate::error::{ClientError, Result};
use crate::signaling::SignalingClient;

/// How a [`Peer::run`] call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerOutcome {
    /// The engine reported a direct connection.
    Connected,
    /// The other participant left; the session has failed.
    PeerLeft,
    /// The gateway ended the session (expiry or failure).
    Closed(SessionState),
    /// The local engine dropped the connection.
    Disconnected,
}

pub struct Peer<E: DescriptorEngine> {
    client: SignalingClient,
    engine: E,
    events: mpsc::UnboundedReceiver<EngineEvent>,
    session_id: SessionId,
    role: Role,
    next_seq: u64,
    remote_applied: bool,
}

impl<E: DescriptorEngine> Peer<E> {
    /// Create a new session as initiator and publish the local offer.
    pub async fn offer(
        url: &Url,
        engine: E,
        events: mpsc::UnboundedReceiver<EngineEvent>,
    ) -> Result<Self> {
        let mut client = SignalingClient::connect(url).await?;
        client.send(&ClientMessage::create()).await?;
        let (session_id, role) = wait_joined(&mut client).await?;

        let mut peer = Self::new(client, engine, events, session_id, role);
        let offer = peer.engine.create_offer()?;
        peer.send(MessageKind::Offer, offer).await?;
        info!(%session_id, "offer published");
        Ok(peer)
    }

    /// Join an existing session as responder. The offer arrives during
    /// [`Peer::run`].
    pub async fn answer(
        url: &Url,
        engine: E,
        events: mpsc::UnboundedReceiver<EngineEvent>,
        session_id: SessionId,
    ) -> Result<Self> {
        let mut client = SignalingClient::connect(url).await?;
        client.send(&ClientMessage::join(session_id)).await?;
        let (session_id, role) = wait_joined(&mut client).await?;
        Ok(Self::new(client, engine, events, session_id, role))
    }

    fn new(
        client: SignalingClient,
        engine: E,
        events: mpsc::UnboundedReceiver<EngineEvent>,
        session_id: SessionId,
        role: Role,
    ) -> Self {
        Self {
            client,
            engine,
            events,
            session_id,
            role,
            next_seq: 0,
            remote_applied: false,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Relay frames and engine events until the engine connects or the
    /// session ends.
    pub async fn run(&mut self) -> Result<PeerOutcome> {
        loop {
            tokio::select! {
                frame = self.client.recv() => {
                    let frame = match frame {
                        Ok(frame) => frame,
                        Err(ClientError::Closed) => return Ok(PeerOutcome::Closed(SessionState::Failed)),
                        Err(err) => return Err(err),
                    };
                    if let Some(outcome) = self.on_frame(frame).await? {
                        return Ok(outcome);
                    }
                }
                event = self.events.recv() => {
                    match event {
                        Some(EngineEvent::LocalCandidate(candidate)) => {
                            self.send(MessageKind::Candidate, candidate).await?;
                        }
                        Some(EngineEvent::Connected) => {
                            info!(session_id = %self.session_id, "peer connection established");
                            return Ok(PeerOutcome::Connected);
                        }
                        Some(EngineEvent::Disconnected) | None => {
                            return Ok(PeerOutcome::Disconnected);
                        }
                    }
                }
            }
        }
    }

    /// Leave the session: send `bye`, close the engine and the socket.
    pub async fn hang_up(mut self) -> E {
        if let Err(err) = self.client.send(&ClientMessage::bye(self.session_id)).await {
            debug!("bye not delivered: {}", err);
        }
        self.engine.close();
        if let Err(err) = self.client.close().await {
            debug!("socket close failed: {}", err);
        }
        self.engine
    }

    async fn on_frame(&mut self, frame: ServerMessage) -> Result<Option<PeerOutcome>> {
        match frame {
            ServerMessage::Relay {
                from,
                kind,
                payload,
                seq,
            } => {
                debug!(%from, %kind, seq, "relay received");
                match kind {
                    MessageKind::Offer => {
                        if self.role != Role::Responder || self.remote_applied {
                            warn!(%from, "ignoring unexpected offer");
                            return Ok(None);
                        }
                        let answer = self.engine.accept_offer(&payload)?;
                        self.remote_applied = true;
                        self.send(MessageKind::Answer, answer).await?;
                    }
                    MessageKind::Answer => {
                        // A remote description is applied at most once.
                        if self.role != Role::Initiator || self.remote_applied {
                            warn!(%from, "ignoring unexpected answer");
                            return Ok(None);
                        }
                        self.engine.accept_answer(&payload)?;
                        self.remote_applied = true;
                    }
                    MessageKind::Candidate => {
                        if let Err(err) = self.engine.add_remote_candidate(&payload) {
                            warn!("remote candidate rejected: {}", err);
                        }
                    }
                }
                Ok(None)
            }
            ServerMessage::PeerJoined { role } => {
                info!(session_id = %self.session_id, %role, "peer joined");
                Ok(None)
            }
            ServerMessage::PeerLeft { role } => {
                info!(session_id = %self.session_id, %role, "peer left");
                Ok(Some(PeerOutcome::PeerLeft))
            }
            ServerMessage::Closed { state } => Ok(Some(PeerOutcome::Closed(state))),
            ServerMessage::Error { code, message } => match code {
                ErrorCode::ProtocolViolation => {
                    warn!("gateway rejected a message: {}", message);
                    Ok(None)
                }
                code => Err(ClientError::Rejected { code, message }),
            },
            ServerMessage::Joined { .. } => {
                Err(ClientError::Unexpected("second joined frame".into()))
            }
        }
    }

    async fn send(&mut self, kind: MessageKind, payload: String) -> Result<()> {
        self.next_seq += 1;
        let msg = ClientMessage::handshake(kind, self.session_id, payload, self.next_seq);
        self.client.send(&msg).await
    }
}

async fn wait_joined(client: &mut SignalingClient) -> Result<(SessionId, Role)> {
    match client.recv().await? {
        ServerMessage::Joined {
            session_id,
            participant_id,
            role,
        } => {
            info!(%session_id, %participant_id, %role, "joined session");
            Ok((session_id, role))
        }
        ServerMessage::Error { code, message } => Err(ClientError::Rejected { code, message }),
        other => Err(ClientError::Unexpected(format!("{:?}", other))),
    }
}
