use rendezvous_common::ErrorCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid gateway url: {0}")]
    InvalidUrl(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("gateway rejected request ({code}): {message}")]
    Rejected { code: ErrorCode, message: String },

    #[error("descriptor engine failed: {0}")]
    Engine(String),

    #[error("unexpected frame: {0}")]
    Unexpected(String),

    #[error("signaling connection closed")]
    Closed,
}

impl ClientError {
    pub fn engine(msg: impl std::fmt::Display) -> Self {
        Self::Engine(msg.to_string())
    }
}
