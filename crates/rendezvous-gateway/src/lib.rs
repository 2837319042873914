#![forbid(unsafe_code)]

//! Rendezvous Gateway - pairs two WebRTC peers and relays their handshake.
//!
//! The gateway:
//! 1. Creates a session for the initiator and admits a single responder
//! 2. Relays the offer, the answer and ICE candidates between them in order
//! 3. Never inspects descriptor or candidate payloads
//!
//! Media never flows through the gateway; once the peers hold each other's
//! descriptors they connect directly.

pub mod channel;
pub mod config;
pub mod gateway;
pub mod registry;
pub mod session;
pub mod signal;
pub mod web;

pub use channel::{CloseReason, Outbox, RelayChannel};
pub use config::{Args, GatewayConfig};
pub use gateway::{Gateway, ParticipantHandle};
pub use registry::{RegistrySnapshot, SessionRegistry};
pub use session::{Effects, Session, SessionLimits};
