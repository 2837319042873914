//! Relay channel: the outbound FIFO bound to one participant.
//!
//! The session holds a cloned [`RelayChannel`] handle for each bound slot; the
//! transport owns the matching [`Outbox`] and writes whatever it yields to the
//! wire. Closing is idempotent and does not discard frames queued before the
//! close, so a final `peer_left` or `closed` notice still reaches the client.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use rendezvous_common::{ServerMessage, SignalError};
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::{mpsc, watch};

/// Why a channel was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Participant sent `bye`.
    Bye,
    /// Transport reported EOF, a close frame or a write failure.
    Disconnected,
    /// Outbound buffer stayed full past the send timeout.
    Stalled,
    /// Session idled out before the handshake completed.
    SessionExpired,
    /// Session reached `Failed` because of the other participant.
    SessionEnded,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            CloseReason::Bye => "bye",
            CloseReason::Disconnected => "disconnected",
            CloseReason::Stalled => "stalled",
            CloseReason::SessionExpired => "session expired",
            CloseReason::SessionEnded => "session ended",
        };
        f.write_str(text)
    }
}

struct Shared {
    reason: OnceLock<CloseReason>,
    closed_tx: watch::Sender<bool>,
}

/// Sending half of a participant's relay channel.
#[derive(Clone)]
pub struct RelayChannel {
    tx: mpsc::Sender<ServerMessage>,
    shared: Arc<Shared>,
    send_timeout: Duration,
}

impl std::fmt::Debug for RelayChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayChannel")
            .field("closed", &self.close_reason())
            .field("queued", &(self.tx.max_capacity() - self.tx.capacity()))
            .finish()
    }
}

/// Receiving half, drained by the transport writer.
pub struct Outbox {
    rx: mpsc::Receiver<ServerMessage>,
    closed_rx: watch::Receiver<bool>,
}

impl RelayChannel {
    pub fn new(capacity: usize, send_timeout: Duration) -> (Self, Outbox) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (closed_tx, closed_rx) = watch::channel(false);
        let channel = Self {
            tx,
            shared: Arc::new(Shared {
                reason: OnceLock::new(),
                closed_tx,
            }),
            send_timeout,
        };
        (channel, Outbox { rx, closed_rx })
    }

    /// Queue a frame for the participant, waiting while the buffer is full.
    ///
    /// A buffer that stays full for longer than the send timeout closes the
    /// channel with [`CloseReason::Stalled`].
    pub async fn send(&self, message: ServerMessage) -> Result<(), SignalError> {
        if self.is_closed() {
            return Err(SignalError::ChannelClosed);
        }
        match self.tx.send_timeout(message, self.send_timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => {
                self.close(CloseReason::Stalled);
                Err(SignalError::ChannelClosed)
            }
            Err(SendTimeoutError::Closed(_)) => {
                self.close(CloseReason::Disconnected);
                Err(SignalError::ChannelClosed)
            }
        }
    }

    /// Queue a frame without waiting. Used on teardown paths that run under
    /// the registry lock.
    pub fn try_send(&self, message: ServerMessage) -> Result<(), SignalError> {
        if self.is_closed() {
            return Err(SignalError::ChannelClosed);
        }
        match self.tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.close(CloseReason::Stalled);
                Err(SignalError::ChannelClosed)
            }
            Err(TrySendError::Closed(_)) => {
                self.close(CloseReason::Disconnected);
                Err(SignalError::ChannelClosed)
            }
        }
    }

    /// Close the channel. Returns `true` only for the call that closed it.
    pub fn close(&self, reason: CloseReason) -> bool {
        let first = self.shared.reason.set(reason).is_ok();
        if first {
            self.shared.closed_tx.send_replace(true);
        }
        first
    }

    pub fn is_closed(&self) -> bool {
        self.shared.reason.get().is_some()
    }

    /// Resolves once the channel is closed, for whatever reason.
    pub async fn closed(&self) {
        let mut closed_rx = self.shared.closed_tx.subscribe();
        let _ = closed_rx.wait_for(|closed| *closed).await;
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.reason.get().copied()
    }
}

impl Outbox {
    /// Next frame for the wire, in enqueue order.
    ///
    /// After the channel is closed the remaining buffered frames are still
    /// returned; `None` means closed and drained.
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        loop {
            if *self.closed_rx.borrow() {
                return self.rx.try_recv().ok();
            }
            tokio::select! {
                biased;
                msg = self.rx.recv() => return msg,
                changed = self.closed_rx.changed() => {
                    if changed.is_err() {
                        // Every sender is gone; the mpsc side ends on its own.
                        return self.rx.recv().await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rendezvous_common::{MessageKind, Role};

    fn candidate(n: u64) -> ServerMessage {
        ServerMessage::Relay {
            from: Role::Initiator,
            kind: MessageKind::Candidate,
            payload: format!("c{}", n),
            seq: n,
        }
    }

    #[tokio::test]
    async fn test_delivery_is_fifo() {
        let (channel, mut outbox) = RelayChannel::new(16, Duration::from_secs(1));
        for n in 0..10 {
            channel.send(candidate(n)).await.unwrap();
        }
        for n in 0..10 {
            assert_eq!(outbox.recv().await, Some(candidate(n)));
        }
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (channel, _outbox) = RelayChannel::new(4, Duration::from_secs(1));
        assert!(channel.close(CloseReason::Bye));
        assert!(!channel.close(CloseReason::Disconnected));
        assert_eq!(channel.close_reason(), Some(CloseReason::Bye));
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (channel, _outbox) = RelayChannel::new(4, Duration::from_secs(1));
        channel.close(CloseReason::Bye);
        assert_eq!(
            channel.send(candidate(0)).await,
            Err(SignalError::ChannelClosed)
        );
        assert_eq!(channel.try_send(candidate(0)), Err(SignalError::ChannelClosed));
    }

    #[tokio::test]
    async fn test_outbox_drains_then_ends_after_close() {
        let (channel, mut outbox) = RelayChannel::new(4, Duration::from_secs(1));
        channel.send(candidate(1)).await.unwrap();
        channel.send(candidate(2)).await.unwrap();
        channel.close(CloseReason::SessionEnded);
        assert_eq!(outbox.recv().await, Some(candidate(1)));
        assert_eq!(outbox.recv().await, Some(candidate(2)));
        assert_eq!(outbox.recv().await, None);
    }

    #[tokio::test]
    async fn test_pending_recv_wakes_on_close() {
        let (channel, mut outbox) = RelayChannel::new(4, Duration::from_secs(1));
        let reader = tokio::spawn(async move { outbox.recv().await });
        tokio::task::yield_now().await;
        channel.close(CloseReason::SessionExpired);
        assert_eq!(reader.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_full_buffer_past_timeout_stalls_channel() {
        let (channel, _outbox) = RelayChannel::new(1, Duration::from_millis(20));
        channel.send(candidate(0)).await.unwrap();
        assert_eq!(
            channel.send(candidate(1)).await,
            Err(SignalError::ChannelClosed)
        );
        assert_eq!(channel.close_reason(), Some(CloseReason::Stalled));
    }

    #[tokio::test]
    async fn test_dropped_outbox_reports_disconnect() {
        let (channel, outbox) = RelayChannel::new(4, Duration::from_secs(1));
        drop(outbox);
        assert_eq!(
            channel.send(candidate(0)).await,
            Err(SignalError::ChannelClosed)
        );
        assert_eq!(channel.close_reason(), Some(CloseReason::Disconnected));
    }

    #[tokio::test]
    async fn test_closed_resolves_for_every_handle() {
        let (channel, _outbox) = RelayChannel::new(1, Duration::from_millis(20));
        let watcher = channel.clone();
        let waiting = tokio::spawn(async move { watcher.closed().await });
        tokio::task::yield_now().await;
        assert!(!waiting.is_finished());

        channel.send(candidate(0)).await.unwrap();
        assert!(channel.send(candidate(1)).await.is_err());
        tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .expect("closed in time")
            .unwrap();
        // Already closed: resolves immediately.
        channel.closed().await;
    }
}
