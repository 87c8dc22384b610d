//! WebSocket signaling server: admission, matchmaking and relay for P2P pairs

mod actor;
mod messages;
mod server;
mod types;

pub use actor::MatchmakerHandle;
pub use messages::{ClientMessage, ServerMessage, Signal};
pub use server::{DEFAULT_SIGNALING_PORT, SignalingServer};
pub use types::{OutboundMessage, SessionId, SignalingError};
