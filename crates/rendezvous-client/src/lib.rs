#![forbid(unsafe_code)]

//! Peer-side client for the rendezvous gateway.
//!
//! [`SignalingClient`] speaks the gateway's WebSocket protocol, and [`Peer`]
//! drives one side of the offer/answer exchange on top of an injected
//! [`DescriptorEngine`].

pub mod engine;
pub mod error;
pub mod peer;
pub mod signaling;

pub use engine::{DescriptorEngine, EngineEvent, StaticEngine};
pub use error::{ClientError, Result};
pub use peer::{Peer, PeerOutcome};
pub use signaling::{parse_gateway_url, SignalingClient};
