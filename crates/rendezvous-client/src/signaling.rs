use futures::{SinkExt, StreamExt};
use rendezvous_common::{ClientMessage, ServerMessage};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

use crate::error::{ClientError, Result};

/// Parse and check a gateway signaling URL (`ws://` or `wss://`).
pub fn parse_gateway_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw).map_err(|err| ClientError::InvalidUrl(format!("{}: {}", raw, err)))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(ClientError::InvalidUrl(format!(
            "unsupported scheme {:?}, expected ws or wss",
            other
        ))),
    }
}

pub struct SignalingClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl SignalingClient {
    pub async fn connect(url: &Url) -> Result<Self> {
        let (ws, _) = connect_async(url.as_str()).await?;
        debug!("connected to {}", url);
        Ok(Self { ws })
    }

    pub async fn send(&mut self, msg: &ClientMessage) -> Result<()> {
        let text = serde_json::to_string(msg)?;
        self.ws.send(Message::Text(text.into())).await?;
        Ok(())
    }

    /// Next gateway frame. Non-text frames are skipped; a close frame or EOF
    /// yields [`ClientError::Closed`].
    pub async fn recv(&mut self) -> Result<ServerMessage> {
        while let Some(msg) = self.ws.next().await {
            match msg? {
                Message::Text(text) => return Ok(serde_json::from_str(&text)?),
                Message::Close(_) => break,
                _ => continue,
            }
        }
        Err(ClientError::Closed)
    }

    pub async fn close(&mut self) -> Result<()> {
        match self.ws.close(None).await {
            Ok(()) => Ok(()),
            Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed)
            | Err(tokio_tungstenite::tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
