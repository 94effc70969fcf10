//! # Relay Core
//!
//! The pairing/session engine and everything it drives: control messages,
//! session state, the call registry, the buffer/flush policy, and the
//! segment store. The transport (WebSocket actors in `src/websocket.rs`)
//! and the HTTP query surface sit outside this module and only talk to it
//! through `CallRegistry` and `SegmentStore`.

pub mod buffer;   // Time-windowed accumulate/flush with the WebM header patch
pub mod message;  // Control messages + the PeerLink outbound seam
pub mod registry; // Queues, pairing, relay, lifecycle
pub mod session;  // Session, Role, ConnId, per-role lanes
pub mod storage;  // Durable segment files
