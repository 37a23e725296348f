//! Dispatch loops feeding the call manager.
//!
//! One loop per event source: the signaling channel and the primary peer
//! connection. Dispatch is an exhaustive match over the typed message
//! union, so a new message kind is a compile-time-checked addition.

use std::sync::Arc;

use log::debug;
use tokio::sync::mpsc;

use super::manager::CallManager;
use super::peer::PeerEvent;
use crate::signaling::{SignalingEvent, SignalingMessage};

pub(crate) async fn run_signaling_loop(
    manager: Arc<CallManager>,
    mut events: mpsc::Receiver<SignalingEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            SignalingEvent::Message(message) => dispatch_message(&manager, message).await,
            SignalingEvent::Closed => {
                manager.handle_transport_closed().await;
                break;
            }
        }
    }
}

pub(crate) async fn dispatch_message(manager: &Arc<CallManager>, message: SignalingMessage) {
    debug!("Received signaling: {}", message.kind());
    match message {
        SignalingMessage::Offer { sdp, target } => manager.handle_offer(sdp, target).await,
        SignalingMessage::Answer { sdp, target } => manager.handle_answer(sdp, target).await,
        SignalingMessage::IceCandidate { candidate, target } => {
            manager.handle_candidate(candidate, target).await
        }
        SignalingMessage::PendingUpdate => manager.handle_pending_update().await,
        SignalingMessage::CallEnded { session_id } => manager.handle_call_ended(session_id).await,
        SignalingMessage::AgentReady { .. } | SignalingMessage::JoinSession { .. } => {
            // Registration handshake is endpoint-to-relay only.
            debug!("Ignoring registration message echoed by the relay");
        }
    }
}

pub(crate) async fn run_peer_loop(manager: Arc<CallManager>, mut events: mpsc::Receiver<PeerEvent>) {
    while let Some(event) = events.recv().await {
        manager.handle_peer_event(event).await;
    }
}
