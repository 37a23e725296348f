//! Recording relay: mirrors the local media to the server-side sink.
//!
//! Unlike the primary connection, the description exchange happens over a
//! single request/response call, not the signaling relay: the endpoint
//! sends its offer in the request body and gets the sink's answer back
//! synchronously. No candidate exchange beyond what the descriptions
//! embed. Failure to start is never fatal to the call.

use std::sync::Arc;

use log::{info, warn};
use tokio::sync::Mutex;

use super::peer::{MediaPeer, MediaPeerFactory, SdpKind};
use crate::backend::BackendClient;
use crate::media::LocalMediaSet;
use crate::types::call::{CallRole, SessionId};
use crate::types::events::{EventBus, RecordingFailed};

pub struct RecordingRelayManager {
    backend: Arc<BackendClient>,
    factory: Arc<dyn MediaPeerFactory>,
    event_bus: Arc<EventBus>,
    enabled: bool,
    peer: Mutex<Option<Arc<dyn MediaPeer>>>,
}

impl RecordingRelayManager {
    pub fn new(
        backend: Arc<BackendClient>,
        factory: Arc<dyn MediaPeerFactory>,
        event_bus: Arc<EventBus>,
        enabled: bool,
    ) -> Self {
        Self {
            backend,
            factory,
            event_bus,
            enabled,
            peer: Mutex::new(None),
        }
    }

    /// Negotiate the recording leg for the current track set. Re-running
    /// this after a track addition replaces the previous leg; the sink
    /// restarts its recorder under the same `{session, role}` key.
    ///
    /// Any failure is non-fatal: logged, surfaced as a one-shot
    /// `RecordingFailed` notice, and the call proceeds without recording.
    /// There is no retry.
    pub async fn start(&self, media: &LocalMediaSet, session_id: &SessionId, role: CallRole) {
        if !self.enabled {
            return;
        }
        if let Err(e) = self.negotiate(media, session_id, role).await {
            warn!("Recording negotiation failed for session {session_id} ({role}): {e:#}");
            let _ = self.event_bus.recording_failed.send(Arc::new(RecordingFailed {
                session_id: session_id.clone(),
                role,
            }));
        }
    }

    async fn negotiate(
        &self,
        media: &LocalMediaSet,
        session_id: &SessionId,
        role: CallRole,
    ) -> Result<(), anyhow::Error> {
        self.close_peer().await;

        // The candidate event stream is intentionally dropped: the
        // exchange is trickle-free, candidates ride inside the
        // descriptions.
        let (peer, _events) = self.factory.create_peer().await?;

        for track in media.tracks() {
            peer.add_track(track).await?;
        }

        let offer = peer.create_offer().await?;
        peer.set_local_description(SdpKind::Offer, &offer).await?;

        let answer = self.backend.record_offer(&offer, session_id, role).await?;
        peer.set_remote_description(SdpKind::Answer, &answer.sdp)
            .await?;

        *self.peer.lock().await = Some(peer);
        info!("Recording started for session {session_id} as {role}");
        Ok(())
    }

    /// Stop recording: tell the sink (fire-and-forget; by the time this
    /// runs the call is already ending) and drop the local leg. Tolerates
    /// a leg that was never negotiated.
    pub async fn stop(&self, session_id: &SessionId, role: CallRole) {
        if !self.enabled {
            return;
        }
        if let Err(e) = self.backend.record_stop(session_id, role).await {
            warn!("Recording stop request failed for session {session_id}: {e:#}");
        }
        self.close_peer().await;
    }

    pub async fn is_running(&self) -> bool {
        self.peer.lock().await.is_some()
    }

    async fn close_peer(&self) {
        if let Some(peer) = self.peer.lock().await.take() {
            peer.close().await;
        }
    }
}
