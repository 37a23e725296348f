//! Call-related error types.

use crate::types::call::CallRole;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("a call is already in progress: {0}")]
    CallInProgress(String),

    #[error("no active call")]
    NoActiveCall,

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] super::state::InvalidTransition),

    #[error("operation not valid for role {0}")]
    WrongRole(CallRole),

    #[error("media acquisition failed: {0}")]
    MediaAcquisition(String),

    #[error("signaling error: {0}")]
    Signaling(String),

    #[error("peer connection error: {0}")]
    Peer(String),

    #[error("backend request failed: {0}")]
    Backend(String),

    #[error("not connected")]
    NotConnected,
}
