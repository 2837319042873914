//! Descriptor engine capability.
//!
//! The engine owns the actual peer connection: it produces and consumes the
//! opaque descriptors and candidates the gateway relays, and reports
//! connectivity through [`EngineEvent`]s. The signaling code never looks
//! inside a descriptor.

use tokio::sync::mpsc;

use crate::error::{ClientError, Result};

/// Asynchronous notification from the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A local ICE candidate to trickle to the peer.
    LocalCandidate(String),
    /// The direct peer connection is up; signaling is no longer needed.
    Connected,
    /// The direct peer connection went away.
    Disconnected,
}

pub trait DescriptorEngine: Send {
    /// Produce the local offer (initiator side).
    fn create_offer(&mut self) -> Result<String>;

    /// Apply the remote offer and produce the local answer (responder side).
    fn accept_offer(&mut self, offer: &str) -> Result<String>;

    /// Apply the remote answer (initiator side).
    fn accept_answer(&mut self, answer: &str) -> Result<()>;

    fn add_remote_candidate(&mut self, candidate: &str) -> Result<()>;

    /// Tear the connection down. Idempotent.
    fn close(&mut self);
}

/// Engine with fixed local descriptors and candidates.
///
/// Used by the `rendezvous-peer` tool to exercise a gateway without a media
/// stack, and by tests. Reports `Connected` once both descriptors are applied.
#[derive(Debug)]
pub struct StaticEngine {
    local_descriptor: String,
    local_candidates: Vec<String>,
    events: mpsc::UnboundedSender<EngineEvent>,
    local_set: bool,
    remote_descriptor: Option<String>,
    remote_candidates: Vec<String>,
    closed: bool,
}

impl StaticEngine {
    pub fn new(
        local_descriptor: impl Into<String>,
        local_candidates: Vec<String>,
    ) -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let engine = Self {
            local_descriptor: local_descriptor.into(),
            local_candidates,
            events,
            local_set: false,
            remote_descriptor: None,
            remote_candidates: Vec::new(),
            closed: false,
        };
        (engine, rx)
    }

    pub fn remote_descriptor(&self) -> Option<&str> {
        self.remote_descriptor.as_deref()
    }

    pub fn remote_candidates(&self) -> &[String] {
        &self.remote_candidates
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(ClientError::engine("engine is closed"));
        }
        Ok(())
    }

    fn set_local(&mut self) {
        self.local_set = true;
        for candidate in &self.local_candidates {
            let _ = self.events.send(EngineEvent::LocalCandidate(candidate.clone()));
        }
        self.maybe_connected();
    }

    fn set_remote(&mut self, descriptor: &str) {
        self.remote_descriptor = Some(descriptor.to_string());
        self.maybe_connected();
    }

    fn maybe_connected(&self) {
        if self.local_set && self.remote_descriptor.is_some() {
            let _ = self.events.send(EngineEvent::Connected);
        }
    }
}

impl DescriptorEngine for StaticEngine {
    fn create_offer(&mut self) -> Result<String> {
        self.ensure_open()?;
        if self.local_set {
            return Err(ClientError::engine("local description already set"));
        }
        self.set_local();
        Ok(self.local_descriptor.clone())
    }

    fn accept_offer(&mut self, offer: &str) -> Result<String> {
        self.ensure_open()?;
        if self.remote_descriptor.is_some() {
            return Err(ClientError::engine("remote description already set"));
        }
        self.remote_descriptor = Some(offer.to_string());
        self.set_local();
        Ok(self.local_descriptor.clone())
    }

    fn accept_answer(&mut self, answer: &str) -> Result<()> {
        self.ensure_open()?;
        if !self.local_set {
            return Err(ClientError::engine("answer without a local offer"));
        }
        if self.remote_descriptor.is_some() {
            return Err(ClientError::engine("remote description already set"));
        }
        self.set_remote(answer);
        Ok(())
    }

    fn add_remote_candidate(&mut self, candidate: &str) -> Result<()> {
        self.ensure_open()?;
        self.remote_candidates.push(candidate.to_string());
        Ok(())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.events.send(EngineEvent::Disconnected);
        }
    }
}
