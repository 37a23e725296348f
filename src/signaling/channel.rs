//! The signaling channel: typed messages over a relay transport.

use super::message::SignalingMessage;
use crate::transport::{SignalingTransport, SignalingTransportFactory, TransportEvent};
use crate::types::call::EndpointId;
use log::{debug, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

const CHANNEL_CAPACITY: usize = 100;

/// An event delivered by the signaling channel.
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// A typed message arrived, in relay order.
    Message(SignalingMessage),
    /// The transport closed; no further events follow. For a live call
    /// this is a hard failure, equivalent to a remote call end.
    Closed,
}

/// Bidirectional, ordered message channel between one endpoint and the
/// signaling relay.
///
/// Messages are delivered in the order the relay sent them. The channel
/// does not survive a reconnect; once [`SignalingEvent::Closed`] is
/// delivered the channel is dead. After [`close`](Self::close), sends are
/// swallowed: teardown messages are inherently best-effort.
pub struct SignalingChannel {
    transport: Arc<dyn SignalingTransport>,
    closed: AtomicBool,
}

impl SignalingChannel {
    /// Opens a relay connection for `endpoint_id` and returns the channel
    /// together with its ordered event stream.
    pub async fn connect(
        factory: &dyn SignalingTransportFactory,
        endpoint_id: &EndpointId,
    ) -> Result<(Arc<Self>, mpsc::Receiver<SignalingEvent>), anyhow::Error> {
        let (transport, events) = factory.create_transport(endpoint_id.as_str()).await?;
        let (channel, rx) = Self::from_transport(transport, events);
        Ok((channel, rx))
    }

    /// Wraps an already-connected transport. Used directly by tests.
    pub fn from_transport(
        transport: Arc<dyn SignalingTransport>,
        events: mpsc::Receiver<TransportEvent>,
    ) -> (Arc<Self>, mpsc::Receiver<SignalingEvent>) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::task::spawn(decode_pump(events, tx));
        (
            Arc::new(Self {
                transport,
                closed: AtomicBool::new(false),
            }),
            rx,
        )
    }

    /// Serialize and send one message to the relay.
    pub async fn send(&self, message: &SignalingMessage) -> Result<(), anyhow::Error> {
        if self.closed.load(Ordering::SeqCst) {
            debug!("Dropping {} send on closed channel", message.kind());
            return Ok(());
        }
        let text = serde_json::to_string(message)?;
        self.transport.send_text(&text).await
    }

    /// Close the channel. Idempotent; subsequent sends are swallowed.
    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.transport.disconnect().await;
        }
    }
}

async fn decode_pump(
    mut events: mpsc::Receiver<TransportEvent>,
    tx: mpsc::Sender<SignalingEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Connected => {}
            TransportEvent::MessageReceived(text) => {
                match serde_json::from_str::<SignalingMessage>(&text) {
                    Ok(message) => {
                        if tx.send(SignalingEvent::Message(message)).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => warn!("Dropping malformed signaling frame: {e}"),
                }
            }
            TransportEvent::Disconnected => break,
        }
    }
    let _ = tx.send(SignalingEvent::Closed).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::mock_transport_pair;
    use crate::types::call::SessionId;

    #[tokio::test]
    async fn test_send_serializes_to_text_frame() {
        let (transport, _event_tx, event_rx) = mock_transport_pair();
        let (channel, _events) = SignalingChannel::from_transport(transport.clone(), event_rx);

        channel
            .send(&SignalingMessage::JoinSession {
                session_id: SessionId::new("session_1"),
            })
            .await
            .unwrap();

        let sent = transport.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0],
            r#"{"type":"join_session","session_id":"session_1"}"#
        );
    }

    #[tokio::test]
    async fn test_messages_delivered_in_order_and_malformed_dropped() {
        let (transport, event_tx, event_rx) = mock_transport_pair();
        let (_channel, mut events) = SignalingChannel::from_transport(transport, event_rx);

        event_tx
            .send(TransportEvent::MessageReceived(
                r#"{"type":"pending_update"}"#.to_string(),
            ))
            .await
            .unwrap();
        event_tx
            .send(TransportEvent::MessageReceived("not json".to_string()))
            .await
            .unwrap();
        event_tx
            .send(TransportEvent::MessageReceived(
                r#"{"type":"call_ended"}"#.to_string(),
            ))
            .await
            .unwrap();
        event_tx.send(TransportEvent::Disconnected).await.unwrap();

        assert!(matches!(
            events.recv().await,
            Some(SignalingEvent::Message(SignalingMessage::PendingUpdate))
        ));
        assert!(matches!(
            events.recv().await,
            Some(SignalingEvent::Message(SignalingMessage::CallEnded { .. }))
        ));
        assert!(matches!(events.recv().await, Some(SignalingEvent::Closed)));
    }

    #[tokio::test]
    async fn test_sends_after_close_are_swallowed() {
        let (transport, _event_tx, event_rx) = mock_transport_pair();
        let (channel, _events) = SignalingChannel::from_transport(transport.clone(), event_rx);

        channel.close().await;
        channel.close().await; // idempotent

        channel
            .send(&SignalingMessage::PendingUpdate)
            .await
            .unwrap();
        assert!(transport.sent.lock().await.is_empty());
        assert!(transport.is_closed());
    }
}
