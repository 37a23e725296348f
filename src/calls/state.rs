//! Call session state machine implementation.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::types::call::{CallRole, EndCallReason, EndpointId, SessionId};

/// Current state of a call session.
#[derive(Debug, Clone, Serialize, Default)]
pub enum CallState {
    /// Session exists only locally; nothing announced yet.
    #[default]
    Idle,
    /// Call announced over the out-of-band request; waiting for the
    /// counterpart to appear in the session.
    AwaitingPeer { announced_at: DateTime<Utc> },
    /// Description exchange in flight.
    Negotiating,
    /// Description exchange complete; media path established.
    Active { started_at: DateTime<Utc> },
    /// Terminal.
    Ended {
        reason: EndCallReason,
        ended_at: DateTime<Utc>,
        duration_secs: Option<i64>,
    },
}

impl CallState {
    /// A session counts as live until it reaches its terminal state; a
    /// second call attempt while one is live is rejected.
    pub fn is_live(&self) -> bool {
        !self.is_ended()
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active { .. })
    }

    pub fn is_negotiating(&self) -> bool {
        matches!(self, Self::Negotiating)
    }

    pub fn is_ended(&self) -> bool {
        matches!(self, Self::Ended { .. })
    }
}

/// State transitions for call sessions.
#[derive(Debug, Clone)]
pub enum CallTransition {
    /// Caller announced the call / agent accepted a pending call.
    CallAnnounced,
    /// Agent: local offer created. Caller: remote offer received.
    NegotiationStarted,
    /// Answer applied; description exchange is complete. The first media
    /// frame is not required.
    NegotiationComplete,
    /// Any terminal trigger: hangup, rejection, remote end, transport
    /// loss, media or negotiation failure.
    Terminated { reason: EndCallReason },
}

/// One call attempt. Owned and mutated only by the state machine, in
/// response to signaling events or local user actions.
#[derive(Debug, Clone, Serialize)]
pub struct CallSession {
    pub session_id: SessionId,
    pub role: CallRole,
    /// Counterpart endpoint on the signaling channel. The agent learns it
    /// from the pending-call assignment; absent until then.
    pub peer_endpoint_id: Option<EndpointId>,
    pub caller_name: String,
    pub state: CallState,
    pub created_at: DateTime<Utc>,
}

impl CallSession {
    pub fn new(session_id: SessionId, role: CallRole, caller_name: impl Into<String>) -> Self {
        Self {
            session_id,
            role,
            peer_endpoint_id: None,
            caller_name: caller_name.into(),
            state: CallState::Idle,
            created_at: Utc::now(),
        }
    }

    /// Whether this session's role creates the primary-connection offer.
    pub fn is_offerer(&self) -> bool {
        self.role.is_offerer()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        match &self.state {
            CallState::Active { started_at } => Some(*started_at),
            _ => None,
        }
    }

    /// Apply a state transition. Returns error if transition is invalid.
    pub fn apply_transition(
        &mut self,
        transition: CallTransition,
    ) -> Result<(), InvalidTransition> {
        let new_state = match (&self.state, transition) {
            (CallState::Idle, CallTransition::CallAnnounced) => CallState::AwaitingPeer {
                announced_at: Utc::now(),
            },
            (CallState::AwaitingPeer { .. }, CallTransition::NegotiationStarted) => {
                CallState::Negotiating
            }
            (CallState::Negotiating, CallTransition::NegotiationComplete) => CallState::Active {
                started_at: Utc::now(),
            },
            (CallState::Active { started_at }, CallTransition::Terminated { reason }) => {
                let duration = Utc::now().signed_duration_since(*started_at).num_seconds();
                CallState::Ended {
                    reason,
                    ended_at: Utc::now(),
                    duration_secs: Some(duration),
                }
            }
            // Hangup and failures are valid in every non-terminal state,
            // including before anything was announced.
            (
                CallState::Idle | CallState::AwaitingPeer { .. } | CallState::Negotiating,
                CallTransition::Terminated { reason },
            ) => CallState::Ended {
                reason,
                ended_at: Utc::now(),
                duration_secs: None,
            },
            (current, transition) => {
                return Err(InvalidTransition {
                    current_state: format!("{:?}", current),
                    attempted: format!("{:?}", transition),
                });
            }
        };
        self.state = new_state;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}
