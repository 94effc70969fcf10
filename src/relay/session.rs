//! # Session State
//!
//! A `Session` pairs exactly one client connection with one operator
//! connection for the duration both stay connected. It owns the per-role
//! audio accumulation state ("lanes"), fully initialized at construction —
//! there is no lazy buffer setup anywhere in the relay path.
//!
//! ## Invariant:
//! A connection appears in at most one place at a time: one waiting queue or
//! one session slot. The registry enforces this; `Session` itself is
//! immutable apart from its lanes.

use crate::relay::message::PeerLink;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use uuid::Uuid;

/// Which side of a call a connection is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Client,
    Operator,
}

impl Role {
    /// Role name as used in segment filenames and control messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Operator => "operator",
        }
    }

    /// The other side of the call.
    pub fn counterpart(&self) -> Role {
        match self {
            Role::Client => Role::Operator,
            Role::Operator => Role::Client,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable identity of one live connection, usable as a map key.
///
/// Assigned by the registry when the transport hands over a connection;
/// opaque to everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(Uuid);

impl ConnId {
    pub fn new() -> Self {
        ConnId(Uuid::new_v4())
    }
}

impl Default for ConnId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One side of a session: the connection identity plus its outbound channel.
pub struct Peer {
    pub conn_id: ConnId,
    pub link: Arc<dyn PeerLink>,
}

/// Accumulation state for one direction of a session.
///
/// Bytes collect in `buffer` in arrival order until the flush policy decides
/// to persist them; `last_flush` is the opportunistic-timer reference point.
pub struct Lane {
    pub buffer: Vec<u8>,
    pub last_flush: Instant,
}

impl Lane {
    fn new() -> Self {
        Self {
            buffer: Vec::new(),
            last_flush: Instant::now(),
        }
    }
}

/// An active client/operator pairing.
///
/// ## Thread Safety:
/// The peer slots are immutable after construction. Each lane has its own
/// mutex so buffer mutation never contends with registry structure changes,
/// and the two directions of a call never contend with each other.
pub struct Session {
    pub id: String,
    client: Peer,
    operator: Peer,
    client_lane: Mutex<Lane>,
    operator_lane: Mutex<Lane>,
}

impl Session {
    /// Build a session with both lanes initialized and `last_flush` set to
    /// now for both roles.
    pub fn new(id: String, client: Peer, operator: Peer) -> Self {
        Self {
            id,
            client,
            operator,
            client_lane: Mutex::new(Lane::new()),
            operator_lane: Mutex::new(Lane::new()),
        }
    }

    /// The peer occupying the given role slot.
    pub fn peer(&self, role: Role) -> &Peer {
        match role {
            Role::Client => &self.client,
            Role::Operator => &self.operator,
        }
    }

    /// The lane accumulating bytes forwarded *toward* the given role.
    pub fn lane(&self, role: Role) -> &Mutex<Lane> {
        match role {
            Role::Client => &self.client_lane,
            Role::Operator => &self.operator_lane,
        }
    }

    /// Which role a connection holds in this session, if any.
    pub fn role_of(&self, conn_id: ConnId) -> Option<Role> {
        if self.client.conn_id == conn_id {
            Some(Role::Client)
        } else if self.operator.conn_id == conn_id {
            Some(Role::Operator)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::message::{ControlMessage, SendError};

    struct NullLink;

    impl PeerLink for NullLink {
        fn send_control(&self, _m: &ControlMessage) -> Result<(), SendError> {
            Ok(())
        }
        fn send_frame(&self, _f: Vec<u8>) -> Result<(), SendError> {
            Ok(())
        }
    }

    fn peer() -> Peer {
        Peer {
            conn_id: ConnId::new(),
            link: Arc::new(NullLink),
        }
    }

    #[test]
    fn role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Client).unwrap(), r#""client""#);
        assert_eq!(
            serde_json::to_string(&Role::Operator).unwrap(),
            r#""operator""#
        );
        assert_eq!(Role::Client.counterpart(), Role::Operator);
        assert_eq!(Role::Operator.counterpart(), Role::Client);
    }

    #[test]
    fn lanes_start_empty_for_both_roles() {
        let session = Session::new("s1".to_string(), peer(), peer());
        assert!(session.lane(Role::Client).lock().unwrap().buffer.is_empty());
        assert!(session
            .lane(Role::Operator)
            .lock()
            .unwrap()
            .buffer
            .is_empty());
    }

    #[test]
    fn role_of_resolves_both_slots() {
        let client = peer();
        let operator = peer();
        let client_id = client.conn_id;
        let operator_id = operator.conn_id;

        let session = Session::new("s1".to_string(), client, operator);
        assert_eq!(session.role_of(client_id), Some(Role::Client));
        assert_eq!(session.role_of(operator_id), Some(Role::Operator));
        assert_eq!(session.role_of(ConnId::new()), None);
    }
}
