use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque call session identifier.
///
/// Generated by the caller endpoint when it initiates a call and
/// authoritative for the call's lifetime; every signaling message after
/// the registration handshake is scoped to one of these.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(format!("session_{:016x}", rand::rng().random::<u64>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of one endpoint on the signaling relay.
///
/// The relay routes by this identifier; the `caller_`/`agent_` prefix is
/// part of the wire contract (the relay uses it to pick the counterpart
/// within a session).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(String);

impl EndpointId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate(role: CallRole) -> Self {
        Self(format!(
            "{}_{:016x}",
            role.as_str(),
            rand::rng().random::<u64>()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which side of the call an endpoint plays. Fixed at session creation.
///
/// The agent is always the offerer on the primary connection and the
/// caller always the answerer, so two simultaneous offers (glare) cannot
/// occur. Both roles offer toward the recording sink, which is a separate
/// connection with its own exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallRole {
    Caller,
    Agent,
}

impl CallRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Caller => "caller",
            Self::Agent => "agent",
        }
    }

    /// Whether this role creates the offer on the primary connection.
    pub fn is_offerer(&self) -> bool {
        matches!(self, Self::Agent)
    }
}

impl fmt::Display for CallRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndCallReason {
    /// Local user hung up.
    Hangup,
    /// The counterpart ended the call.
    RemoteEnded,
    /// The pending call was rejected.
    Rejected,
    /// The signaling channel dropped while the call was live.
    TransportLost,
    /// Local media devices could not be acquired.
    MediaFailure,
    /// A description or candidate could not be applied.
    NegotiationFailed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_carry_role_prefix() {
        assert!(EndpointId::generate(CallRole::Caller)
            .as_str()
            .starts_with("caller_"));
        assert!(EndpointId::generate(CallRole::Agent)
            .as_str()
            .starts_with("agent_"));
        assert!(SessionId::generate().as_str().starts_with("session_"));
    }

    #[test]
    fn test_role_polarity() {
        assert!(CallRole::Agent.is_offerer());
        assert!(!CallRole::Caller.is_offerer());
    }
}
