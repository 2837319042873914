use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
};
use futures::{stream::StreamExt, SinkExt};
use rendezvous_common::{ClientMessage, ClientMessageType, ServerMessage, SessionId, SignalError};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::channel::{CloseReason, RelayChannel};
use crate::gateway::{Gateway, ParticipantHandle};

const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Live WebSocket connection count, shared with the health endpoints.
pub type ConnectionCounter = Arc<AtomicUsize>;

/// One counted connection. The count drops with the slot, including when the
/// upgrade never completes and axum discards the upgrade callback.
#[derive(Debug)]
pub struct ConnectionSlot(ConnectionCounter);

impl ConnectionSlot {
    pub fn acquire(counter: &ConnectionCounter, limit: usize) -> Option<Self> {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| {
                (active < limit).then_some(active + 1)
            })
            .ok()
            .map(|_| Self(counter.clone()))
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(gateway): State<Gateway>,
    State(connections): State<ConnectionCounter>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let config = gateway.config();
    let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());
    if !config.origin_allowed(origin) {
        warn!("rejected websocket from {} with origin {:?}", addr, origin);
        return StatusCode::FORBIDDEN.into_response();
    }

    let Some(slot) = ConnectionSlot::acquire(&connections, config.max_connections) else {
        warn!("connection limit reached, rejecting {}", addr);
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };

    let max_frame = config.max_frame_bytes;
    ws.max_message_size(max_frame)
        .max_frame_size(max_frame)
        .on_failed_upgrade(move |err| debug!("websocket upgrade from {} failed: {}", addr, err))
        .on_upgrade(move |socket| async move {
            handle_socket(socket, gateway, addr).await;
            drop(slot);
        })
        .into_response()
}

async fn reject(channel: &RelayChannel, err: &SignalError) {
    let _ = channel.send(ServerMessage::from(err)).await;
}

async fn handle_socket(stream: WebSocket, gateway: Gateway, addr: SocketAddr) {
    info!("client connecting from {}", addr);
    let config = gateway.config().clone();
    let (mut sender, mut receiver) = stream.split();
    let (channel, mut outbox) = gateway.open_channel();

    let (disconnect_tx, mut disconnect_rx) = mpsc::channel::<()>(1);

    let mut writer = tokio::spawn(async move {
        while let Some(frame) = outbox.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(err) => {
                    warn!("failed to encode frame: {}", err);
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sender.send(Message::Close(None)).await;
        let _ = disconnect_tx.try_send(());
    });

    let mut participant: Option<ParticipantHandle> = None;
    let mut message_window_start = Instant::now();
    let mut message_count: u32 = 0;
    let join_deadline = tokio::time::sleep(config.join_timeout);
    tokio::pin!(join_deadline);

    loop {
        tokio::select! {
            _ = disconnect_rx.recv() => {
                break;
            }
            _ = channel.closed() => {
                debug!("relay channel for {} closed: {:?}", addr, channel.close_reason());
                break;
            }
            _ = &mut join_deadline, if participant.is_none() => {
                reject(&channel, &SignalError::protocol("join timeout")).await;
                break;
            }
            msg = receiver.next() => {
                let Some(msg) = msg else { break; };
                let Ok(msg) = msg else { break; };

                let now = Instant::now();
                if now.duration_since(message_window_start) >= RATE_WINDOW {
                    message_window_start = now;
                    message_count = 0;
                }
                message_count = message_count.saturating_add(1);
                if message_count > config.max_messages_per_minute {
                    reject(&channel, &SignalError::protocol("rate limit exceeded")).await;
                    break;
                }

                let text = match msg {
                    Message::Text(text) => text,
                    Message::Binary(_) => {
                        reject(&channel, &SignalError::protocol("binary messages are not supported")).await;
                        break;
                    }
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => continue,
                };

                if text.len() > config.max_frame_bytes {
                    reject(&channel, &SignalError::protocol("message too large")).await;
                    break;
                }

                let envelope: ClientMessage = match serde_json::from_str(&text) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        warn!("invalid JSON from {}: {}", addr, err);
                        reject(&channel, &SignalError::protocol("invalid message envelope")).await;
                        continue;
                    }
                };

                match &participant {
                    Some(handle) => {
                        // Rejections were already reported on the channel.
                        let _ = handle.on_message(envelope).await;
                    }
                    None => {
                        if envelope.kind != ClientMessageType::Join {
                            reject(&channel, &SignalError::protocol("join required before signaling")).await;
                            continue;
                        }
                        let session_id = match envelope.session_id.as_deref() {
                            None => None,
                            Some(raw) => match SessionId::parse(raw) {
                                Some(id) => Some(id),
                                None => {
                                    reject(&channel, &SignalError::not_joinable(format!("unknown session {}", raw))).await;
                                    continue;
                                }
                            },
                        };
                        match gateway.connect(session_id, envelope.role, channel.clone()).await {
                            Ok(handle) => {
                                info!(
                                    "{} joined session {} as {}",
                                    addr,
                                    handle.session_id(),
                                    handle.role()
                                );
                                participant = Some(handle);
                            }
                            Err(err) => {
                                debug!("join from {} rejected: {}", addr, err);
                                reject(&channel, &err).await;
                            }
                        }
                    }
                }
            }
        }
    }

    match participant {
        Some(handle) => handle.close(CloseReason::Disconnected).await,
        None => {
            channel.close(CloseReason::Disconnected);
        }
    }
    // A client that stopped reading can hold the writer in a socket write.
    if tokio::time::timeout(config.send_timeout, &mut writer).await.is_err() {
        warn!("writer for {} did not finish, aborting", addr);
        writer.abort();
    }
    info!("client {} disconnected", addr);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_slot_respects_limit_and_releases_on_drop() {
        let counter: ConnectionCounter = Arc::new(AtomicUsize::new(0));
        let first = ConnectionSlot::acquire(&counter, 2).expect("first slot");
        let second = ConnectionSlot::acquire(&counter, 2).expect("second slot");
        assert!(ConnectionSlot::acquire(&counter, 2).is_none());
        assert_eq!(counter.load(Ordering::Acquire), 2);

        drop(first);
        assert_eq!(counter.load(Ordering::Acquire), 1);
        let third = ConnectionSlot::acquire(&counter, 2).expect("slot freed");
        drop(second);
        drop(third);
        assert_eq!(counter.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_discarded_upgrade_callback_returns_slot() {
        let counter: ConnectionCounter = Arc::new(AtomicUsize::new(0));
        let slot = ConnectionSlot::acquire(&counter, 1).expect("slot");
        let callback = move |_socket: ()| async move {
            drop(slot);
        };
        assert!(ConnectionSlot::acquire(&counter, 1).is_none());
        drop(callback);
        assert_eq!(counter.load(Ordering::Acquire), 0);
        assert!(ConnectionSlot::acquire(&counter, 1).is_some());
    }
}
