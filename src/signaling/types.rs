use std::fmt;
use std::net::SocketAddr;

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Utf8Bytes;

/// Signaling server errors
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("internal error: {0}")]
    Internal(String),
}

const SESSION_ID_PREFIX: &[u8] = b"sess_";
const SESSION_ID_LEN: usize = 21;
const HEX_CHARS: &[u8] = b"0123456789abcdef";

/// Session ID: 21-byte fixed array ("sess_" + 16 hex)
///
/// Assigned by the transport layer when a connection is admitted; never
/// reused for a later connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId {
    bytes: [u8; SESSION_ID_LEN],
    len: u8,
}

impl SessionId {
    pub fn generate() -> Self {
        let mut bytes = [0u8; SESSION_ID_LEN];
        bytes[..5].copy_from_slice(SESSION_ID_PREFIX);

        let mut rng = rand::rng();
        let value: u64 = rng.random();

        for i in 0..16 {
            let nibble = ((value >> (60 - i * 4)) & 0xF) as usize;
            bytes[5 + i] = HEX_CHARS[nibble];
        }
        Self {
            bytes,
            len: SESSION_ID_LEN as u8,
        }
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or("")
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        let mut bytes = [0u8; SESSION_ID_LEN];
        let src = s.as_bytes();
        let len = src.len().min(SESSION_ID_LEN);
        bytes[..len].copy_from_slice(&src[..len]);
        Self {
            bytes,
            len: len as u8,
        }
    }
}

impl Serialize for SessionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for SessionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <&str>::deserialize(deserializer)?;
        Ok(SessionId::from(s))
    }
}

/// Wrapper for outbound WebSocket messages using tungstenite's Utf8Bytes.
#[derive(Debug, Clone)]
pub struct OutboundMessage(Utf8Bytes);

impl OutboundMessage {
    /// Create a new outbound message from any string type
    pub fn new(s: impl Into<Utf8Bytes>) -> Self {
        Self(s.into())
    }

    /// Get the inner Utf8Bytes for tungstenite Message::Text
    pub fn into_inner(self) -> Utf8Bytes {
        self.0
    }
}

impl From<String> for OutboundMessage {
    fn from(s: String) -> Self {
        Self(Utf8Bytes::from(s))
    }
}

/// One live connection as the registry tracks it
#[derive(Debug)]
pub(crate) struct SessionState {
    pub addr: SocketAddr,
    /// Channel for outbound messages to this session
    pub tx: mpsc::UnboundedSender<OutboundMessage>,
    /// Fired at most once to force-close the connection
    pub evict: Option<oneshot::Sender<()>>,
}

impl SessionState {
    /// The connection counts as live while its outbound channel is open
    pub fn is_live(&self) -> bool {
        !self.tx.is_closed()
    }
}
