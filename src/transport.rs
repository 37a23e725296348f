pub use callpoint_tokio_transport::{
    SignalingTransport, SignalingTransportFactory, TokioWebSocketTransportFactory, TransportEvent,
};

#[cfg(test)]
pub mod mock {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::{Mutex, mpsc};

    /// A transport that records everything sent through it, for testing.
    pub struct MockTransport {
        pub sent: Mutex<Vec<String>>,
        closed: AtomicBool,
    }

    impl MockTransport {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            })
        }

        pub fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SignalingTransport for MockTransport {
        async fn send_text(&self, text: &str) -> Result<(), anyhow::Error> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(anyhow::anyhow!("Socket is closed"));
            }
            self.sent.lock().await.push(text.to_string());
            Ok(())
        }

        async fn disconnect(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Builds a mock transport plus the sender half of its event stream,
    /// so tests can inject inbound frames and disconnects.
    pub fn mock_transport_pair() -> (
        Arc<MockTransport>,
        mpsc::Sender<TransportEvent>,
        mpsc::Receiver<TransportEvent>,
    ) {
        let (tx, rx) = mpsc::channel(16);
        (MockTransport::new(), tx, rx)
    }
}
