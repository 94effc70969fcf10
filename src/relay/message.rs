//! # Control Messages and the Peer Seam
//!
//! Structured messages sent over a peer's WebSocket alongside the binary
//! audio frames, plus the `PeerLink` trait the registry uses to reach a
//! peer's outbound channel without knowing anything about actix.
//!
//! ## Message Protocol (server → peer):
//! - `waiting`: client enqueued, no operator available yet
//! - `call_connected`: sent to the client on pairing
//! - `client_connected`: sent to the operator on pairing
//! - `call_ended`: sent to the surviving peer when its counterpart drops

use crate::relay::session::Role;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Control messages delivered as JSON text frames.
///
/// Tagged with a `type` field:
/// `{"type": "call_connected", "session_id": "...", "role": "client"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    /// Client is queued and waiting for an operator.
    #[serde(rename = "waiting")]
    Waiting,

    /// Pairing succeeded; sent to the client side.
    #[serde(rename = "call_connected")]
    CallConnected {
        /// Session id shared by both peers
        session_id: String,
        /// The recipient's own role
        role: Role,
    },

    /// Pairing succeeded; sent to the operator side.
    #[serde(rename = "client_connected")]
    ClientConnected {
        /// Session id shared by both peers
        session_id: String,
        /// The recipient's own role
        role: Role,
    },

    /// The counterpart disconnected and the session was retired.
    #[serde(rename = "call_ended")]
    CallEnded,
}

/// Error returned when a peer's outbound channel is gone.
///
/// This is the transport-closed signal: the peer's mailbox was dropped
/// because its connection actor stopped. It is never fatal — callers route
/// it into the lifecycle path instead of propagating it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendError;

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer connection is closed")
    }
}

impl std::error::Error for SendError {}

/// Outbound channel of one connected peer.
///
/// ## Implementations:
/// - Production: a wrapper over the connection actor's `Addr` (see
///   `src/websocket.rs`), where a closed mailbox maps to `SendError`.
/// - Tests: an in-memory recorder that captures everything it was sent.
///
/// Both methods must be non-blocking: the registry may call them while
/// holding its structural lock, so an implementation may only enqueue.
pub trait PeerLink: Send + Sync {
    /// Queue a structured control message for delivery.
    fn send_control(&self, message: &ControlMessage) -> Result<(), SendError>;

    /// Queue a binary audio frame for delivery, byte-for-byte.
    fn send_frame(&self, frame: Vec<u8>) -> Result<(), SendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waiting_message_shape() {
        let json = serde_json::to_string(&ControlMessage::Waiting).unwrap();
        assert_eq!(json, r#"{"type":"waiting"}"#);
    }

    #[test]
    fn pairing_messages_carry_session_and_role() {
        let msg = ControlMessage::CallConnected {
            session_id: "abc".to_string(),
            role: Role::Client,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"call_connected""#));
        assert!(json.contains(r#""session_id":"abc""#));
        assert!(json.contains(r#""role":"client""#));

        let msg = ControlMessage::ClientConnected {
            session_id: "abc".to_string(),
            role: Role::Operator,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"client_connected""#));
        assert!(json.contains(r#""role":"operator""#));
    }

    #[test]
    fn call_ended_round_trips() {
        let json = serde_json::to_string(&ControlMessage::CallEnded).unwrap();
        assert_eq!(json, r#"{"type":"call_ended"}"#);
        let back: ControlMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ControlMessage::CallEnded);
    }
}
