//! Primary peer connection management.
//!
//! [`MediaPeer`] is the seam between the call logic and the underlying
//! RTC stack; the production implementation lives in
//! [`crate::media::webrtc`], tests substitute fakes.
//! [`PeerConnectionManager`] owns one peer plus the candidate queue and
//! enforces the ordering rules of the exchange.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, mpsc};

use super::candidates::CandidateQueue;
use super::error::CallError;
use crate::media::{LocalTrack, TrackKind};
use crate::signaling::IceCandidate;

/// Which half of the description exchange a session description is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SdpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
        }
    }
}

/// Events surfaced by a media peer connection.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A local connectivity candidate was gathered and should be relayed
    /// to the counterpart.
    CandidateGenerated(IceCandidate),
    /// A remote media track started arriving.
    TrackReceived { kind: TrackKind },
    /// The underlying connection failed or was closed.
    ConnectionClosed,
}

/// One media peer connection (primary leg or recording leg).
#[async_trait]
pub trait MediaPeer: Send + Sync {
    async fn create_offer(&self) -> Result<String, anyhow::Error>;
    async fn create_answer(&self) -> Result<String, anyhow::Error>;
    async fn set_local_description(&self, kind: SdpKind, sdp: &str) -> Result<(), anyhow::Error>;
    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<(), anyhow::Error>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), anyhow::Error>;
    async fn add_track(&self, track: &LocalTrack) -> Result<(), anyhow::Error>;
    /// Closes the connection. Must be idempotent.
    async fn close(&self);
}

/// Creates peer connections together with their event stream.
#[async_trait]
pub trait MediaPeerFactory: Send + Sync {
    async fn create_peer(
        &self,
    ) -> Result<(Arc<dyn MediaPeer>, mpsc::Receiver<PeerEvent>), anyhow::Error>;
}

/// Owns the primary caller↔agent connection and drives its
/// offer/answer/candidate exchange.
///
/// The manager exists from session creation, before the connection
/// itself: candidates relayed ahead of the offer buffer in the queue and
/// drain once the remote description lands. `close` is idempotent.
pub struct PeerConnectionManager {
    inner: Mutex<Inner>,
    closed: AtomicBool,
}

struct Inner {
    peer: Option<Arc<dyn MediaPeer>>,
    queue: CandidateQueue,
}

impl PeerConnectionManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                peer: None,
                queue: CandidateQueue::new(),
            }),
            closed: AtomicBool::new(false),
        }
    }

    /// Install the freshly created connection. Candidates queued before
    /// this stay queued; they depend on a remote description that cannot
    /// have been applied yet.
    pub async fn attach(&self, peer: Arc<dyn MediaPeer>) {
        let mut inner = self.inner.lock().await;
        inner.peer = Some(peer);
    }

    pub async fn is_attached(&self) -> bool {
        self.inner.lock().await.peer.is_some()
    }

    /// Create the local offer and install it as the local description.
    pub async fn create_offer(&self) -> Result<String, CallError> {
        let inner = self.inner.lock().await;
        let peer = Self::peer_of(&inner)?;
        let sdp = peer
            .create_offer()
            .await
            .map_err(|e| CallError::Peer(e.to_string()))?;
        peer.set_local_description(SdpKind::Offer, &sdp)
            .await
            .map_err(|e| CallError::Peer(e.to_string()))?;
        Ok(sdp)
    }

    /// Create the local answer and install it as the local description.
    pub async fn create_answer(&self) -> Result<String, CallError> {
        let inner = self.inner.lock().await;
        let peer = Self::peer_of(&inner)?;
        let sdp = peer
            .create_answer()
            .await
            .map_err(|e| CallError::Peer(e.to_string()))?;
        peer.set_local_description(SdpKind::Answer, &sdp)
            .await
            .map_err(|e| CallError::Peer(e.to_string()))?;
        Ok(sdp)
    }

    /// Install the remote description, then drain every queued candidate
    /// in arrival order. The lock is held across both steps so a
    /// concurrently delivered candidate cannot jump the backlog.
    pub async fn apply_remote_description(
        &self,
        kind: SdpKind,
        sdp: &str,
    ) -> Result<(), CallError> {
        let mut inner = self.inner.lock().await;
        let peer = Self::peer_of(&inner)?.clone();
        peer.set_remote_description(kind, sdp)
            .await
            .map_err(|e| CallError::Peer(e.to_string()))?;
        for candidate in inner.queue.mark_ready() {
            peer.add_ice_candidate(candidate)
                .await
                .map_err(|e| CallError::Peer(e.to_string()))?;
        }
        Ok(())
    }

    /// Queue or apply a relayed candidate, depending on whether the
    /// remote description is in place yet.
    pub async fn handle_remote_candidate(&self, candidate: IceCandidate) -> Result<(), CallError> {
        let mut inner = self.inner.lock().await;
        let ready = inner.queue.push(candidate);
        if ready.is_empty() {
            return Ok(());
        }
        let peer = Self::peer_of(&inner)?.clone();
        for candidate in ready {
            peer.add_ice_candidate(candidate)
                .await
                .map_err(|e| CallError::Peer(e.to_string()))?;
        }
        Ok(())
    }

    pub async fn add_track(&self, track: &LocalTrack) -> Result<(), CallError> {
        let inner = self.inner.lock().await;
        let peer = Self::peer_of(&inner)?;
        peer.add_track(track)
            .await
            .map_err(|e| CallError::Peer(e.to_string()))
    }

    /// Close the connection. Safe to call twice and before `attach`.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let peer = self.inner.lock().await.peer.take();
        if let Some(peer) = peer {
            peer.close().await;
        }
    }

    fn peer_of(inner: &Inner) -> Result<&Arc<dyn MediaPeer>, CallError> {
        inner
            .peer
            .as_ref()
            .ok_or_else(|| CallError::Peer("no connection created yet".to_string()))
    }
}

impl Default for PeerConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}
