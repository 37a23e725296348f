//! Call manager: orchestrates the call lifecycle.
//!
//! One manager per endpoint process, fixed to one role. It owns the
//! single live [`CallSession`], the signaling channel, the primary peer
//! connection, the recording relay leg and the local media set, and it is
//! the only thing that mutates any of them.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info, warn};
use tokio::sync::{Mutex, RwLock, mpsc};

use super::error::CallError;
use super::handler;
use super::peer::{MediaPeerFactory, PeerConnectionManager, PeerEvent, SdpKind};
use super::recording::RecordingRelayManager;
use super::state::{CallSession, CallState, CallTransition};
use crate::backend::BackendClient;
use crate::config::EndpointConfig;
use crate::media::{LocalMediaSet, MediaSource};
use crate::net::HttpClient;
use crate::signaling::{IceCandidate, SignalingChannel, SignalingEvent, SignalingMessage};
use crate::transport::SignalingTransportFactory;
use crate::types::call::{CallRole, EndCallReason, EndpointId, SessionId};
use crate::types::events::{
    CallEnded as CallEndedEvent, EventBus, MediaFailure, PendingUpdate, RemoteTrackAdded,
    StateChanged,
};

pub struct CallManager {
    role: CallRole,
    endpoint_id: EndpointId,
    transport_factory: Arc<dyn SignalingTransportFactory>,
    peer_factory: Arc<dyn MediaPeerFactory>,
    media_source: Arc<dyn MediaSource>,
    backend: Arc<BackendClient>,
    event_bus: Arc<EventBus>,
    recording: Arc<RecordingRelayManager>,

    session: RwLock<Option<CallSession>>,
    channel: Mutex<Option<Arc<SignalingChannel>>>,
    peer: Mutex<Option<Arc<PeerConnectionManager>>>,
    media: Mutex<Option<LocalMediaSet>>,
    torn_down: AtomicBool,
}

impl CallManager {
    pub fn new(
        role: CallRole,
        config: EndpointConfig,
        transport_factory: Arc<dyn SignalingTransportFactory>,
        peer_factory: Arc<dyn MediaPeerFactory>,
        media_source: Arc<dyn MediaSource>,
        http: Arc<dyn HttpClient>,
    ) -> Arc<Self> {
        let backend = Arc::new(BackendClient::new(http, config.backend_base_url.clone()));
        let event_bus = Arc::new(EventBus::new());
        let recording = Arc::new(RecordingRelayManager::new(
            backend.clone(),
            peer_factory.clone(),
            event_bus.clone(),
            config.recording_enabled,
        ));
        Arc::new(Self {
            endpoint_id: EndpointId::generate(role),
            role,
            transport_factory,
            peer_factory,
            media_source,
            backend,
            event_bus,
            recording,
            session: RwLock::new(None),
            channel: Mutex::new(None),
            peer: Mutex::new(None),
            media: Mutex::new(None),
            torn_down: AtomicBool::new(false),
        })
    }

    pub fn role(&self) -> CallRole {
        self.role
    }

    pub fn endpoint_id(&self) -> &EndpointId {
        &self.endpoint_id
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.event_bus.clone()
    }

    /// The backend client, for the listing/login operations an embedding
    /// UI drives directly.
    pub fn backend(&self) -> Arc<BackendClient> {
        self.backend.clone()
    }

    pub async fn session(&self) -> Option<CallSession> {
        self.session.read().await.clone()
    }

    // ---- caller operations ----

    /// Initiate a call: acquire local audio, announce the call to the
    /// backend and join the signaling session. The session then waits in
    /// `AwaitingPeer` for an agent's offer.
    ///
    /// Media comes first: an acquisition failure aborts the attempt
    /// before any signaling happens.
    pub async fn start_call(self: &Arc<Self>, caller_name: &str) -> Result<SessionId, CallError> {
        self.ensure_role(CallRole::Caller)?;
        self.ensure_no_live_session().await?;

        let audio = match self.media_source.acquire_audio().await {
            Ok(track) => track,
            Err(e) => return Err(self.media_failure(e)),
        };
        let media = LocalMediaSet::new(audio);

        let session_id = SessionId::generate();

        let (channel, events) =
            SignalingChannel::connect(self.transport_factory.as_ref(), &self.endpoint_id)
                .await
                .map_err(|e| CallError::Signaling(e.to_string()))?;

        // Close the channel again if announcing the call fails below.
        let channel_guard = scopeguard::guard(channel.clone(), |channel| {
            tokio::task::spawn(async move { channel.close().await });
        });

        self.backend
            .notify_call(caller_name, &self.endpoint_id, &session_id)
            .await
            .map_err(|e| CallError::Backend(e.to_string()))?;

        channel
            .send(&SignalingMessage::JoinSession {
                session_id: session_id.clone(),
            })
            .await
            .map_err(|e| CallError::Signaling(e.to_string()))?;

        let channel = scopeguard::ScopeGuard::into_inner(channel_guard);

        let mut session = CallSession::new(session_id.clone(), CallRole::Caller, caller_name);
        session.apply_transition(CallTransition::CallAnnounced)?;

        self.install_session(session).await;
        *self.media.lock().await = Some(media);
        *self.channel.lock().await = Some(channel);
        self.spawn_signaling_loop(events);

        info!("Call {session_id} announced, awaiting agent");
        Ok(session_id)
    }

    // ---- agent operations ----

    /// Register this agent endpoint with the signaling relay. The channel
    /// outlives individual calls; `pending_update` notices arrive on it
    /// between sessions.
    pub async fn connect(self: &Arc<Self>) -> Result<(), CallError> {
        self.ensure_role(CallRole::Agent)?;
        if self.channel.lock().await.is_some() {
            debug!("Agent already connected to relay");
            return Ok(());
        }

        let (channel, events) =
            SignalingChannel::connect(self.transport_factory.as_ref(), &self.endpoint_id)
                .await
                .map_err(|e| CallError::Signaling(e.to_string()))?;
        channel
            .send(&SignalingMessage::AgentReady {
                agent_id: self.endpoint_id.clone(),
            })
            .await
            .map_err(|e| CallError::Signaling(e.to_string()))?;

        *self.channel.lock().await = Some(channel);
        self.spawn_signaling_loop(events);

        info!("Agent {} registered with relay", self.endpoint_id);
        Ok(())
    }

    /// Accept a pending call: confirm with the backend, acquire media,
    /// create the primary connection and send the offer. The agent is
    /// always the offerer. Entering `Negotiating` also starts the
    /// recording relay against the same local media; that negotiation is
    /// independent of the primary's and may race it.
    pub async fn accept_call(
        self: &Arc<Self>,
        session_id: SessionId,
        caller_name: &str,
        caller_endpoint: Option<EndpointId>,
    ) -> Result<(), CallError> {
        self.ensure_role(CallRole::Agent)?;
        self.ensure_no_live_session().await?;
        if self.channel.lock().await.is_none() {
            return Err(CallError::NotConnected);
        }

        self.backend
            .respond_call(&session_id, true, Some(&self.endpoint_id))
            .await
            .map_err(|e| CallError::Backend(e.to_string()))?;

        let mut session = CallSession::new(session_id.clone(), CallRole::Agent, caller_name);
        session.peer_endpoint_id = caller_endpoint;
        session.apply_transition(CallTransition::CallAnnounced)?;

        // The session exists from here on; failures below tear it down
        // instead of leaving the accepted call half-initialized.
        self.install_session(session).await;

        let audio = match self.media_source.acquire_audio().await {
            Ok(track) => track,
            Err(e) => {
                let err = self.media_failure(e);
                self.teardown(EndCallReason::MediaFailure).await;
                return Err(err);
            }
        };
        let media = LocalMediaSet::new(audio);
        *self.media.lock().await = Some(media.clone());

        let offer = match self.create_primary_offer(&media).await {
            Ok(offer) => offer,
            Err(e) => {
                warn!("Failed to create offer for {session_id}: {e}");
                self.teardown(EndCallReason::NegotiationFailed).await;
                return Err(e);
            }
        };

        self.apply_transition(CallTransition::NegotiationStarted)
            .await?;

        if let Err(e) = self
            .send_message(&SignalingMessage::Offer {
                sdp: offer,
                target: Some(session_id.clone()),
            })
            .await
        {
            self.teardown(EndCallReason::TransportLost).await;
            return Err(e);
        }

        self.spawn_recording_start(&media, &session_id);

        info!("Accepted call {session_id}, offer sent");
        Ok(())
    }

    /// Reject a pending call. No local session is created and nothing is
    /// sent over the signaling channel.
    pub async fn reject_call(&self, session_id: &SessionId) -> Result<(), CallError> {
        self.ensure_role(CallRole::Agent)?;
        self.backend
            .respond_call(session_id, false, None)
            .await
            .map_err(|e| CallError::Backend(e.to_string()))?;
        info!("Rejected pending call {session_id}");
        Ok(())
    }

    // ---- local actions, either role ----

    /// Hang up. Valid in every state, including mid-negotiation. Runs
    /// the unconditional teardown, then tells the backend (best-effort;
    /// it broadcasts `call_ended` to the counterpart). Teardown comes
    /// first so our own copy of that broadcast cannot race it.
    pub async fn hangup(self: &Arc<Self>) -> Result<(), CallError> {
        let snapshot = self.session_snapshot().await.ok_or(CallError::NoActiveCall)?;
        if snapshot.state.is_ended() {
            // Lost the race against a remote end; teardown already ran.
            return Ok(());
        }

        self.teardown(EndCallReason::Hangup).await;

        if let Err(e) = self.backend.end_call(&snapshot.session_id).await {
            warn!(
                "Call-end request failed for session {}: {e:#}",
                snapshot.session_id
            );
        }
        Ok(())
    }

    /// Toggle the microphone at the source; both the primary and the
    /// recording connection observe the shared flag.
    pub async fn set_audio_enabled(&self, enabled: bool) -> Result<(), CallError> {
        let guard = self.media.lock().await;
        let media = guard.as_ref().ok_or(CallError::NoActiveCall)?;
        media.set_audio_enabled(enabled);
        Ok(())
    }

    /// Toggle an already-acquired camera track at the source.
    pub async fn set_video_enabled(&self, enabled: bool) -> Result<(), CallError> {
        let guard = self.media.lock().await;
        let media = guard.as_ref().ok_or(CallError::NoActiveCall)?;
        media.set_video_enabled(enabled);
        Ok(())
    }

    /// Turn on video mid-call. First call acquires the camera track and
    /// adds it to *both* the primary and the recording connection, each
    /// with its own renegotiation: the recording leg re-runs its
    /// offer/answer exchange at once; the primary leg re-offers
    /// immediately when this endpoint is the offerer (agent), otherwise
    /// the track rides the next agent-driven renegotiation.
    ///
    /// Acquisition failure leaves the call running audio-only.
    pub async fn enable_video(self: &Arc<Self>) -> Result<(), CallError> {
        let snapshot = self.session_snapshot().await.ok_or(CallError::NoActiveCall)?;
        if snapshot.state.is_ended() {
            return Err(CallError::NoActiveCall);
        }

        {
            let guard = self.media.lock().await;
            if let Some(media) = guard.as_ref()
                && media.video().is_some()
            {
                media.set_video_enabled(true);
                return Ok(());
            }
        }

        let video = match self.media_source.acquire_video().await {
            Ok(track) => track,
            Err(e) => return Err(self.media_failure(e)),
        };

        let media = {
            let mut guard = self.media.lock().await;
            let media = guard.as_mut().ok_or(CallError::NoActiveCall)?;
            media.set_video(video.clone());
            media.clone()
        };

        let pcm = self.pcm().await?;
        pcm.add_track(&video).await?;

        self.spawn_recording_start(&media, &snapshot.session_id);

        if snapshot.role.is_offerer() {
            let offer = pcm.create_offer().await?;
            self.send_message(&SignalingMessage::Offer {
                sdp: offer,
                target: Some(snapshot.session_id.clone()),
            })
            .await?;
            info!("Renegotiating primary connection with video track");
        }
        Ok(())
    }

    // ---- inbound signaling, called from the dispatch loop ----

    pub(crate) async fn handle_offer(self: &Arc<Self>, sdp: String, target: Option<SessionId>) {
        let Some(snapshot) = self.matching_session(target.as_ref()).await else {
            return;
        };

        if snapshot.role.is_offerer() {
            warn!("Received an offer while acting as offerer; ending negotiation");
            self.teardown(EndCallReason::NegotiationFailed).await;
            return;
        }

        let result = match snapshot.state {
            CallState::AwaitingPeer { .. } => self.answer_initial_offer(&sdp).await,
            // Mid-call renegotiation: the offerer added a track.
            CallState::Active { .. } => self.answer_renegotiation_offer(&sdp).await,
            _ => {
                warn!("Offer out of order in state {:?}", snapshot.state);
                self.teardown(EndCallReason::NegotiationFailed).await;
                return;
            }
        };

        if let Err(e) = result {
            warn!("Failed to answer offer for {}: {e}", snapshot.session_id);
            self.teardown(EndCallReason::NegotiationFailed).await;
        }
    }

    pub(crate) async fn handle_answer(self: &Arc<Self>, sdp: String, target: Option<SessionId>) {
        let Some(snapshot) = self.matching_session(target.as_ref()).await else {
            return;
        };

        if !snapshot.role.is_offerer() {
            warn!("Received an answer while acting as answerer; ending negotiation");
            self.teardown(EndCallReason::NegotiationFailed).await;
            return;
        }

        let result = match snapshot.state {
            CallState::Negotiating => {
                match self.apply_remote_answer(&sdp).await {
                    Ok(()) => {
                        self.apply_transition(CallTransition::NegotiationComplete)
                            .await
                    }
                    Err(e) => Err(e),
                }
            }
            // Answer to a mid-call re-offer; the session stays active.
            CallState::Active { .. } => self.apply_remote_answer(&sdp).await,
            _ => {
                warn!("Answer out of order in state {:?}", snapshot.state);
                self.teardown(EndCallReason::NegotiationFailed).await;
                return;
            }
        };

        if let Err(e) = result {
            warn!("Failed to apply answer for {}: {e}", snapshot.session_id);
            self.teardown(EndCallReason::NegotiationFailed).await;
        }
    }

    pub(crate) async fn handle_candidate(
        self: &Arc<Self>,
        candidate: IceCandidate,
        target: Option<SessionId>,
    ) {
        let Some(snapshot) = self.matching_session(target.as_ref()).await else {
            return;
        };

        let Ok(pcm) = self.pcm().await else {
            debug!("Dropping candidate; no connection manager");
            return;
        };
        if let Err(e) = pcm.handle_remote_candidate(candidate).await {
            warn!(
                "Failed to apply relayed candidate for {}: {e}",
                snapshot.session_id
            );
            self.teardown(EndCallReason::NegotiationFailed).await;
        }
    }

    pub(crate) async fn handle_pending_update(&self) {
        debug!("Pending-call set changed");
        let _ = self.event_bus.pending_update.send(Arc::new(PendingUpdate));
    }

    pub(crate) async fn handle_call_ended(self: &Arc<Self>, session_id: Option<SessionId>) {
        let Some(snapshot) = self.matching_session(session_id.as_ref()).await else {
            return;
        };
        info!("Call {} ended by remote", snapshot.session_id);
        self.teardown(EndCallReason::RemoteEnded).await;
    }

    /// A dropped signaling transport is a hard failure for the live call,
    /// equivalent to a remote call end.
    pub(crate) async fn handle_transport_closed(self: &Arc<Self>) {
        let live = self
            .session_snapshot()
            .await
            .is_some_and(|s| s.state.is_live());
        if live {
            warn!("Signaling transport lost with a live call; ending session");
            self.teardown(EndCallReason::TransportLost).await;
        } else {
            debug!("Signaling transport closed");
            *self.channel.lock().await = None;
        }
    }

    pub(crate) async fn handle_peer_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::CandidateGenerated(candidate) => {
                let Some(session_id) = self.current_session_id().await else {
                    return;
                };
                let message = SignalingMessage::IceCandidate {
                    candidate,
                    target: Some(session_id),
                };
                if let Err(e) = self.send_message(&message).await {
                    debug!("Failed to relay local candidate: {e}");
                }
            }
            PeerEvent::TrackReceived { kind } => {
                if let Some(session_id) = self.current_session_id().await {
                    let _ = self.event_bus.remote_track.send(Arc::new(RemoteTrackAdded {
                        session_id,
                        kind,
                    }));
                }
            }
            PeerEvent::ConnectionClosed => {
                debug!("Primary connection reported closed");
            }
        }
    }

    // ---- negotiation internals ----

    /// Caller side: the offer arrived. Create the primary connection,
    /// apply the remote offer (draining any queued candidates), answer,
    /// and go active. The caller then mirrors its media to the recording
    /// sink.
    async fn answer_initial_offer(self: &Arc<Self>, sdp: &str) -> Result<(), CallError> {
        let media = self
            .media
            .lock()
            .await
            .clone()
            .ok_or(CallError::NoActiveCall)?;

        self.apply_transition(CallTransition::NegotiationStarted)
            .await?;

        let pcm = self.setup_primary_connection(&media).await?;
        pcm.apply_remote_description(SdpKind::Offer, sdp).await?;
        let answer = pcm.create_answer().await?;

        let session_id = self
            .current_session_id()
            .await
            .ok_or(CallError::NoActiveCall)?;
        self.send_message(&SignalingMessage::Answer {
            sdp: answer,
            target: Some(session_id.clone()),
        })
        .await?;

        self.apply_transition(CallTransition::NegotiationComplete)
            .await?;

        self.spawn_recording_start(&media, &session_id);
        Ok(())
    }

    async fn answer_renegotiation_offer(&self, sdp: &str) -> Result<(), CallError> {
        let pcm = self.pcm().await?;
        pcm.apply_remote_description(SdpKind::Offer, sdp).await?;
        let answer = pcm.create_answer().await?;

        let session_id = self
            .current_session_id()
            .await
            .ok_or(CallError::NoActiveCall)?;
        self.send_message(&SignalingMessage::Answer {
            sdp: answer,
            target: Some(session_id),
        })
        .await?;
        info!("Renegotiation answered");
        Ok(())
    }

    async fn apply_remote_answer(&self, sdp: &str) -> Result<(), CallError> {
        self.pcm()
            .await?
            .apply_remote_description(SdpKind::Answer, sdp)
            .await
    }

    /// Agent side: build the primary connection and the local offer.
    async fn create_primary_offer(
        self: &Arc<Self>,
        media: &LocalMediaSet,
    ) -> Result<String, CallError> {
        let pcm = self.setup_primary_connection(media).await?;
        pcm.create_offer().await
    }

    async fn setup_primary_connection(
        self: &Arc<Self>,
        media: &LocalMediaSet,
    ) -> Result<Arc<PeerConnectionManager>, CallError> {
        let (peer, peer_events) = self
            .peer_factory
            .create_peer()
            .await
            .map_err(|e| CallError::Peer(e.to_string()))?;

        let pcm = self.pcm().await?;
        pcm.attach(peer).await;
        for track in media.tracks() {
            pcm.add_track(track).await?;
        }
        self.spawn_peer_loop(peer_events);
        Ok(pcm)
    }

    // ---- teardown ----

    /// Unconditional teardown: stop the recording relay, close the
    /// primary connection, close the signaling channel, release local
    /// media. Runs exactly once per session regardless of which trigger
    /// fired, tolerates resources that were never acquired, and never
    /// fails.
    pub(crate) async fn teardown(self: &Arc<Self>, reason: EndCallReason) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut ended: Option<(SessionId, Option<i64>)> = None;
        {
            let mut guard = self.session.write().await;
            if let Some(session) = guard.as_mut() {
                if !session.state.is_ended()
                    && let Err(e) = session.apply_transition(CallTransition::Terminated { reason })
                {
                    debug!("Teardown transition skipped: {e}");
                }
                let duration_secs = match &session.state {
                    CallState::Ended { duration_secs, .. } => *duration_secs,
                    _ => None,
                };
                ended = Some((session.session_id.clone(), duration_secs));
                self.emit_state(session.session_id.clone(), session.state.clone());
            }
        }

        if let Some((session_id, _)) = &ended {
            self.recording.stop(session_id, self.role).await;
        }

        if let Some(pcm) = self.peer.lock().await.take() {
            pcm.close().await;
        }

        if let Some(channel) = self.channel.lock().await.take() {
            channel.close().await;
        }

        // Dropping the set releases the capture devices.
        *self.media.lock().await = None;

        if let Some((session_id, duration_secs)) = ended {
            info!("Session {session_id} ended: {reason:?}");
            let _ = self.event_bus.call_ended.send(Arc::new(CallEndedEvent {
                session_id,
                reason,
                duration_secs,
            }));
        }
    }

    // ---- plumbing ----

    async fn install_session(&self, session: CallSession) {
        self.torn_down.store(false, Ordering::SeqCst);
        *self.peer.lock().await = Some(Arc::new(PeerConnectionManager::new()));
        let session_id = session.session_id.clone();
        let state = session.state.clone();
        *self.session.write().await = Some(session);
        self.emit_state(session_id, state);
    }

    async fn apply_transition(&self, transition: CallTransition) -> Result<(), CallError> {
        let mut guard = self.session.write().await;
        let session = guard.as_mut().ok_or(CallError::NoActiveCall)?;
        session.apply_transition(transition)?;
        let session_id = session.session_id.clone();
        let state = session.state.clone();
        drop(guard);
        self.emit_state(session_id, state);
        Ok(())
    }

    async fn send_message(&self, message: &SignalingMessage) -> Result<(), CallError> {
        let channel = self
            .channel
            .lock()
            .await
            .clone()
            .ok_or(CallError::NotConnected)?;
        channel
            .send(message)
            .await
            .map_err(|e| CallError::Signaling(e.to_string()))
    }

    /// The current session, provided it is live and the message's
    /// explicit session context (if any) matches. Everything else is
    /// discarded with a log line.
    async fn matching_session(&self, target: Option<&SessionId>) -> Option<CallSession> {
        let snapshot = self.session_snapshot().await;
        let Some(session) = snapshot else {
            debug!("Discarding session message; no session");
            return None;
        };
        if session.state.is_ended() {
            debug!("Discarding message for ended session {}", session.session_id);
            return None;
        }
        if let Some(target) = target
            && *target != session.session_id
        {
            debug!(
                "Discarding message for session {target}; current is {}",
                session.session_id
            );
            return None;
        }
        Some(session)
    }

    async fn session_snapshot(&self) -> Option<CallSession> {
        self.session.read().await.clone()
    }

    async fn current_session_id(&self) -> Option<SessionId> {
        self.session
            .read()
            .await
            .as_ref()
            .map(|s| s.session_id.clone())
    }

    async fn pcm(&self) -> Result<Arc<PeerConnectionManager>, CallError> {
        self.peer.lock().await.clone().ok_or(CallError::NoActiveCall)
    }

    async fn ensure_no_live_session(&self) -> Result<(), CallError> {
        let guard = self.session.read().await;
        match guard.as_ref() {
            Some(session) if session.state.is_live() => {
                Err(CallError::CallInProgress(session.session_id.to_string()))
            }
            _ => Ok(()),
        }
    }

    fn ensure_role(&self, role: CallRole) -> Result<(), CallError> {
        if self.role == role {
            Ok(())
        } else {
            Err(CallError::WrongRole(self.role))
        }
    }

    fn media_failure(&self, error: anyhow::Error) -> CallError {
        let _ = self.event_bus.media_failure.send(Arc::new(MediaFailure {
            message: error.to_string(),
        }));
        CallError::MediaAcquisition(error.to_string())
    }

    fn emit_state(&self, session_id: SessionId, state: CallState) {
        let _ = self
            .event_bus
            .state_changed
            .send(Arc::new(StateChanged { session_id, state }));
    }

    fn spawn_recording_start(self: &Arc<Self>, media: &LocalMediaSet, session_id: &SessionId) {
        let recording = self.recording.clone();
        let media = media.clone();
        let session_id = session_id.clone();
        let role = self.role;
        tokio::task::spawn(async move {
            recording.start(&media, &session_id, role).await;
        });
    }

    fn spawn_signaling_loop(self: &Arc<Self>, events: mpsc::Receiver<SignalingEvent>) {
        let manager = Arc::clone(self);
        tokio::task::spawn(handler::run_signaling_loop(manager, events));
    }

    fn spawn_peer_loop(self: &Arc<Self>, events: mpsc::Receiver<PeerEvent>) {
        let manager = Arc::clone(self);
        tokio::task::spawn(handler::run_peer_loop(manager, events));
    }
}
