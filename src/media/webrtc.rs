//! webrtc-rs backed implementations of the media seams.
//!
//! One API instance per connection, default codecs and interceptors.
//! Handlers registered on the peer connection forward into an event pump
//! consumed by the call manager.

use std::sync::Arc;

use log::{debug, warn};
use tokio::sync::mpsc;

use async_trait::async_trait;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::{LocalTrack, MediaSource, TrackKind};
use crate::calls::{MediaPeer, MediaPeerFactory, PeerEvent, SdpKind};
use crate::signaling::IceCandidate;

const PEER_EVENT_CAPACITY: usize = 64;
const STREAM_ID: &str = "callpoint";

/// A peer connection backed by an `RTCPeerConnection`.
pub struct RtcMediaPeer {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl MediaPeer for RtcMediaPeer {
    async fn create_offer(&self) -> Result<String, anyhow::Error> {
        let offer = self.pc.create_offer(None).await?;
        Ok(offer.sdp)
    }

    async fn create_answer(&self) -> Result<String, anyhow::Error> {
        let answer = self.pc.create_answer(None).await?;
        Ok(answer.sdp)
    }

    async fn set_local_description(&self, kind: SdpKind, sdp: &str) -> Result<(), anyhow::Error> {
        let desc = to_description(kind, sdp)?;
        self.pc.set_local_description(desc).await?;
        Ok(())
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<(), anyhow::Error> {
        let desc = to_description(kind, sdp)?;
        self.pc.set_remote_description(desc).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), anyhow::Error> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_m_line_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<(), anyhow::Error> {
        let rtp = track
            .rtp
            .clone()
            .ok_or_else(|| anyhow::anyhow!("local track {} has no RTP handle", track.id))?;
        self.pc.add_track(rtp).await?;
        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!("Error closing peer connection: {e}");
        }
    }
}

fn to_description(kind: SdpKind, sdp: &str) -> Result<RTCSessionDescription, anyhow::Error> {
    let desc = match kind {
        SdpKind::Offer => RTCSessionDescription::offer(sdp.to_string())?,
        SdpKind::Answer => RTCSessionDescription::answer(sdp.to_string())?,
    };
    Ok(desc)
}

/// Creates `RtcMediaPeer`s configured with the endpoint's STUN servers.
pub struct RtcPeerFactory {
    stun_servers: Vec<String>,
}

impl RtcPeerFactory {
    pub fn new(stun_servers: Vec<String>) -> Self {
        Self { stun_servers }
    }

    fn build_api() -> Result<API, anyhow::Error> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        Ok(APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build())
    }
}

#[async_trait]
impl MediaPeerFactory for RtcPeerFactory {
    async fn create_peer(
        &self,
    ) -> Result<(Arc<dyn MediaPeer>, mpsc::Receiver<PeerEvent>), anyhow::Error> {
        let api = Self::build_api()?;
        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.stun_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await?);

        let (event_tx, event_rx) = mpsc::channel(PEER_EVENT_CAPACITY);

        let tx = event_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx
                            .send(PeerEvent::CandidateGenerated(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_m_line_index: init.sdp_mline_index,
                                username_fragment: init.username_fragment,
                            }))
                            .await;
                    }
                    Err(e) => warn!("Failed to serialize gathered candidate: {e}"),
                }
            })
        }));

        let tx = event_tx.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let tx = tx.clone();
            Box::pin(async move {
                let kind = if track.kind() == RTPCodecType::Video {
                    TrackKind::Video
                } else {
                    TrackKind::Audio
                };
                debug!("Remote {kind} track started");
                let _ = tx.send(PeerEvent::TrackReceived { kind }).await;
            })
        }));

        let tx = event_tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = tx.clone();
            Box::pin(async move {
                debug!("Peer connection state: {state}");
                if matches!(
                    state,
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
                ) {
                    let _ = tx.send(PeerEvent::ConnectionClosed).await;
                }
            })
        }));

        Ok((Arc::new(RtcMediaPeer { pc }), event_rx))
    }
}

/// Sample-fed local media.
///
/// Acquisition builds `TrackLocalStaticSample` tracks; the embedder's
/// capture loop writes encoded samples into them and consults the
/// track's enabled flag to pause or resume.
pub struct SampleMediaSource;

impl SampleMediaSource {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SampleMediaSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaSource for SampleMediaSource {
    async fn acquire_audio(&self) -> Result<LocalTrack, anyhow::Error> {
        let track: Arc<dyn TrackLocal + Send + Sync> = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            "audio".to_owned(),
            STREAM_ID.to_owned(),
        ));
        Ok(LocalTrack::new("audio", TrackKind::Audio, Some(track)))
    }

    async fn acquire_video(&self) -> Result<LocalTrack, anyhow::Error> {
        let track: Arc<dyn TrackLocal + Send + Sync> = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                ..Default::default()
            },
            "video".to_owned(),
            STREAM_ID.to_owned(),
        ));
        Ok(LocalTrack::new("video", TrackKind::Video, Some(track)))
    }
}
