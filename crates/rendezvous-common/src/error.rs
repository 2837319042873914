//! Error taxonomy shared by the gateway and its clients.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using the signaling error type.
pub type Result<T> = std::result::Result<T, SignalError>;

/// Error code carried in `error` frames on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    CapacityExceeded,
    SessionNotJoinable,
    ProtocolViolation,
    ChannelClosed,
    Internal,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCode::CapacityExceeded => "CapacityExceeded",
            ErrorCode::SessionNotJoinable => "SessionNotJoinable",
            ErrorCode::ProtocolViolation => "ProtocolViolation",
            ErrorCode::ChannelClosed => "ChannelClosed",
            ErrorCode::Internal => "Internal",
        };
        f.write_str(name)
    }
}

/// Errors surfaced by the signaling core.
///
/// Every variant maps onto exactly one [`ErrorCode`]. None of them is fatal to
/// the process: the worst outcome is a single session moving to `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalError {
    /// Registry is at its concurrent-session limit.
    #[error("session capacity reached ({limit} sessions)")]
    CapacityExceeded { limit: usize },

    /// Unknown, full, expired or failed session.
    #[error("session not joinable: {0}")]
    SessionNotJoinable(String),

    /// Message violates the handshake ordering or shape.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Send attempted on a torn-down channel.
    #[error("channel closed")]
    ChannelClosed,

    /// Session invariant broken; the affected session is failed.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SignalError {
    /// Create a not-joinable error from any displayable type.
    pub fn not_joinable(msg: impl std::fmt::Display) -> Self {
        Self::SessionNotJoinable(msg.to_string())
    }

    /// Create a protocol violation from any displayable type.
    pub fn protocol(msg: impl std::fmt::Display) -> Self {
        Self::ProtocolViolation(msg.to_string())
    }

    /// Create an internal error from any displayable type.
    pub fn internal(msg: impl std::fmt::Display) -> Self {
        Self::Internal(msg.to_string())
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            SignalError::CapacityExceeded { .. } => ErrorCode::CapacityExceeded,
            SignalError::SessionNotJoinable(_) => ErrorCode::SessionNotJoinable,
            SignalError::ProtocolViolation(_) => ErrorCode::ProtocolViolation,
            SignalError::ChannelClosed => ErrorCode::ChannelClosed,
            SignalError::Internal(_) => ErrorCode::Internal,
        }
    }
}
