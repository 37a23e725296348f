/// Tokio-based WebSocket transport implementation for callpoint
///
/// This crate provides a concrete implementation of the SignalingTransport
/// trait using tokio-tungstenite. The signaling relay speaks JSON text
/// frames over a persistent WebSocket keyed by endpoint identifier.
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, trace, warn};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

/// An event produced by the transport layer.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The transport has successfully connected.
    Connected,
    /// A text frame has been received from the relay.
    MessageReceived(String),
    /// The connection was lost.
    Disconnected,
}

/// Represents an active connection to the signaling relay.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Sends a text frame to the relay.
    async fn send_text(&self, text: &str) -> Result<(), anyhow::Error>;

    /// Closes the connection.
    async fn disconnect(&self);
}

/// A factory responsible for creating new transport instances.
#[async_trait]
pub trait SignalingTransportFactory: Send + Sync {
    /// Opens a relay connection for the given endpoint identifier and
    /// returns it, along with a stream of events.
    async fn create_transport(
        &self,
        endpoint_id: &str,
    ) -> Result<(Arc<dyn SignalingTransport>, mpsc::Receiver<TransportEvent>), anyhow::Error>;
}

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<RawWs, Message>;
type WsStream = SplitStream<RawWs>;

const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Tokio WebSocket transport toward the signaling relay.
pub struct TokioWebSocketTransport {
    ws_sink: Arc<Mutex<Option<WsSink>>>,
}

impl TokioWebSocketTransport {
    fn new(sink: WsSink) -> Self {
        Self {
            ws_sink: Arc::new(Mutex::new(Some(sink))),
        }
    }
}

#[async_trait]
impl SignalingTransport for TokioWebSocketTransport {
    async fn send_text(&self, text: &str) -> Result<(), anyhow::Error> {
        let mut sink_guard = self.ws_sink.lock().await;
        let sink = sink_guard
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Socket is closed"))?;

        debug!("--> Sending frame: {} bytes", text.len());
        sink.send(Message::Text(text.to_string().into()))
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket send error: {}", e))?;
        Ok(())
    }

    async fn disconnect(&self) {
        let mut sink_guard = self.ws_sink.lock().await;
        if let Some(mut sink) = sink_guard.take() {
            let _ = sink.send(Message::Close(None)).await;
        }
    }
}

/// Factory connecting to a relay at `<base_url>/<endpoint_id>`.
pub struct TokioWebSocketTransportFactory {
    base_url: String,
}

impl TokioWebSocketTransportFactory {
    /// Create a factory for the given relay base URL
    /// (e.g. `ws://support.example.net/ws`).
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl SignalingTransportFactory for TokioWebSocketTransportFactory {
    async fn create_transport(
        &self,
        endpoint_id: &str,
    ) -> Result<(Arc<dyn SignalingTransport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), endpoint_id);
        info!("Dialing {url}");

        let (client, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket connect failed: {}", e))?;

        let (sink, stream) = client.split();

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let transport = Arc::new(TokioWebSocketTransport::new(sink));

        let event_tx_clone = event_tx.clone();
        tokio::task::spawn(read_pump(stream, event_tx_clone));

        let _ = event_tx.send(TransportEvent::Connected).await;

        Ok((transport, event_rx))
    }
}

async fn read_pump(mut stream: WsStream, event_tx: mpsc::Sender<TransportEvent>) {
    loop {
        match stream.next().await {
            Some(Ok(msg)) => match msg {
                Message::Text(text) => {
                    debug!("<-- Received frame: {} bytes", text.len());
                    if event_tx
                        .send(TransportEvent::MessageReceived(text.to_string()))
                        .await
                        .is_err()
                    {
                        warn!("Event receiver dropped, closing read pump");
                        break;
                    }
                }
                Message::Close(_) => {
                    trace!("Received close frame");
                    break;
                }
                other => {
                    trace!("Ignoring non-text frame: {:?}", other);
                }
            },
            Some(Err(e)) => {
                error!("Error reading from websocket: {e}");
                break;
            }
            None => {
                trace!("Websocket stream ended");
                break;
            }
        }
    }

    let _ = event_tx.send(TransportEvent::Disconnected).await;
}
