use crate::calls::CallState;
use crate::media::TrackKind;
use crate::types::call::{CallRole, EndCallReason, SessionId};
use std::sync::Arc;
use tokio::sync::broadcast;

// The size of the broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 100;

/// The session moved to a new lifecycle state.
#[derive(Debug, Clone)]
pub struct StateChanged {
    pub session_id: SessionId,
    pub state: CallState,
}

/// The pending-call set changed; agents should refresh their listing.
#[derive(Debug, Clone)]
pub struct PendingUpdate;

/// The session reached its terminal state.
#[derive(Debug, Clone)]
pub struct CallEnded {
    pub session_id: SessionId,
    pub reason: EndCallReason,
    pub duration_secs: Option<i64>,
}

/// A remote media track started arriving on the primary connection.
#[derive(Debug, Clone)]
pub struct RemoteTrackAdded {
    pub session_id: SessionId,
    pub kind: TrackKind,
}

/// Recording could not be negotiated or renegotiated. One-shot notice;
/// the call continues without recording.
#[derive(Debug, Clone)]
pub struct RecordingFailed {
    pub session_id: SessionId,
    pub role: CallRole,
}

/// Local media device acquisition failed. One-shot notice.
#[derive(Debug, Clone)]
pub struct MediaFailure {
    pub message: String,
}

// Macro to generate EventBus fields and constructor
macro_rules! define_event_bus {
    ($(($field:ident, $type:ty)),* $(,)?) => {
        /// Typed event bus toward the (out-of-scope) UI layer: one
        /// broadcast channel per event type.
        #[derive(Debug)]
        pub struct EventBus {
            $(
                pub $field: broadcast::Sender<$type>,
            )*
        }

        impl EventBus {
            pub fn new() -> Self {
                Self {
                    $(
                        $field: broadcast::channel(CHANNEL_CAPACITY).0,
                    )*
                }
            }
        }
    };
}

define_event_bus! {
    (state_changed, Arc<StateChanged>),
    (pending_update, Arc<PendingUpdate>),
    (call_ended, Arc<CallEnded>),
    (remote_track, Arc<RemoteTrackAdded>),
    (recording_failed, Arc<RecordingFailed>),
    (media_failure, Arc<MediaFailure>),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
