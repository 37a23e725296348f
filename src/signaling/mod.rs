//! Signaling layer: the typed message union exchanged with the relay and
//! the channel that carries it.
//!
//! The relay speaks self-contained JSON records over a persistent
//! WebSocket keyed by endpoint identifier. Each record carries a `type`
//! discriminator; everything after the registration handshake is scoped
//! to a session.

mod channel;
mod message;

pub use channel::{SignalingChannel, SignalingEvent};
pub use message::{IceCandidate, SignalingMessage};
