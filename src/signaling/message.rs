//! Wire format of the signaling relay.

use crate::types::call::{EndpointId, SessionId};
use serde::{Deserialize, Serialize};

/// A connectivity candidate as carried on the wire.
///
/// Field names follow the browser's `RTCIceCandidate` JSON shape, which
/// is what the relay forwards verbatim between endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_m_line_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }
}

/// Messages exchanged over the signaling channel.
///
/// Every variant except the registration handshake (`AgentReady`,
/// `JoinSession`) is scoped to a session. `target` is present on
/// endpoint-to-relay sends; the relay strips it and routes within the
/// session, so deliveries may rely on implicit session context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingMessage {
    /// Session description offer, agent to caller.
    Offer {
        sdp: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<SessionId>,
    },
    /// Session description answer, caller to agent.
    Answer {
        sdp: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<SessionId>,
    },
    /// Connectivity candidate, relayed to the session counterpart.
    IceCandidate {
        candidate: IceCandidate,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<SessionId>,
    },
    /// Agent-directed notice that the pending-call set changed.
    PendingUpdate,
    /// The session was ended by the counterpart or the backend.
    CallEnded {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
    },
    /// Registration handshake: agent announces itself to the relay.
    AgentReady { agent_id: EndpointId },
    /// Registration handshake: caller joins its own session.
    JoinSession { session_id: SessionId },
}

impl SignalingMessage {
    /// The explicit session context of the message, when it carries one.
    pub fn session_context(&self) -> Option<&SessionId> {
        match self {
            Self::Offer { target, .. }
            | Self::Answer { target, .. }
            | Self::IceCandidate { target, .. } => target.as_ref(),
            Self::CallEnded { session_id } => session_id.as_ref(),
            Self::JoinSession { session_id } => Some(session_id),
            Self::PendingUpdate | Self::AgentReady { .. } => None,
        }
    }

    /// Message kind for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice_candidate",
            Self::PendingUpdate => "pending_update",
            Self::CallEnded { .. } => "call_ended",
            Self::AgentReady { .. } => "agent_ready",
            Self::JoinSession { .. } => "join_session",
        }
    }
}
