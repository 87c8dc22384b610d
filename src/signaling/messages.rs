use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A handshake payload relayed between room members.
///
/// The kind set is closed: anything else fails to parse and is never
/// forwarded. The payload itself is opaque to the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum Signal {
    /// An offer/answer session description
    SessionDescription(Value),

    /// A connectivity candidate
    Candidate(Value),
}

/// Messages sent from client to server
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Handshake message to forward to the peer
    #[serde(rename = "from_client")]
    FromClient { signal: Signal },

    /// The direct peer link is up; this session no longer needs the relay
    #[serde(rename = "link_established")]
    LinkEstablished,
}

/// Messages sent from server to client
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// A room now exists; exactly one member is told to open the handshake
    #[serde(rename = "room_created")]
    RoomCreated { initiator: bool },

    /// Handshake message relayed from the peer
    #[serde(rename = "from_server")]
    FromServer { signal: Signal },

    /// Error response
    #[serde(rename = "error")]
    Error { message: String },
}
