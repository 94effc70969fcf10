//! # Call Registry
//!
//! The process-wide pairing/session engine. Owns the two FIFO waiting
//! queues, the active-session table, and the connection → session index,
//! and drives the three operations everything else funnels into:
//!
//! - `connect`: enqueue a peer and attempt pairing
//! - `relay`: forward one binary frame to the sender's counterpart and
//!   hand it to the buffer/flush policy
//! - `disconnect`: lifecycle teardown, delivered exactly once per
//!   connection (extra deliveries are no-ops)
//!
//! ## Locking:
//! One `Mutex` guards structural state only (queues, tables, index). Lane
//! buffers live behind per-session mutexes, outbound sends are non-blocking
//! mailbox pushes, and segment writes happen with no registry lock held, so
//! a slow disk or peer never stalls unrelated sessions.

use crate::relay::buffer::FlushPolicy;
use crate::relay::message::{ControlMessage, PeerLink};
use crate::relay::session::{ConnId, Peer, Role, Session};
use crate::relay::storage::SegmentStore;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Why a connection could not be enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectError {
    /// The waiting acknowledgment could not be delivered; the peer is
    /// already gone.
    PeerGone,
    /// The waiting queue for this role is full.
    AtCapacity,
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectError::PeerGone => write!(f, "peer disconnected before registration"),
            ConnectError::AtCapacity => write!(f, "waiting queue is full"),
        }
    }
}

/// Monotonic counters describing relay activity since process start.
///
/// Plain atomics, no locks; readers take `Relaxed` snapshots for the
/// health/metrics endpoints.
#[derive(Debug, Default)]
pub struct RelayMetrics {
    /// Sessions successfully established.
    pub pairings_total: AtomicU64,
    /// Binary frames forwarded to a counterpart.
    pub frames_relayed: AtomicU64,
    /// Payload bytes forwarded to a counterpart.
    pub bytes_relayed: AtomicU64,
    /// Frames dropped because the sender was in no session.
    pub frames_dropped: AtomicU64,
    /// Segments persisted (timed and final flushes).
    pub segments_written: AtomicU64,
    /// Segment writes that failed (bytes retained for retry).
    pub write_failures: AtomicU64,
    /// Sessions retired through the lifecycle path.
    pub sessions_ended: AtomicU64,
}

/// Structural state: everything the registry lock protects.
struct RegistryInner {
    waiting_clients: VecDeque<ConnId>,
    waiting_operators: VecDeque<ConnId>,
    /// Outbound channel of every live connection, waiting or paired.
    links: HashMap<ConnId, Arc<dyn PeerLink>>,
    /// Active sessions by session id.
    sessions: HashMap<String, Arc<Session>>,
    /// Connection → session index; kept in step with `sessions` so relay
    /// resolution is O(1) instead of a scan over active sessions.
    by_conn: HashMap<ConnId, String>,
}

/// The pairing/relay/lifecycle engine.
pub struct CallRegistry {
    inner: Mutex<RegistryInner>,
    store: SegmentStore,
    policy: FlushPolicy,
    metrics: RelayMetrics,
    max_waiting: usize,
}

impl CallRegistry {
    pub fn new(store: SegmentStore, flush_interval: Duration, max_waiting: usize) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                waiting_clients: VecDeque::new(),
                waiting_operators: VecDeque::new(),
                links: HashMap::new(),
                sessions: HashMap::new(),
                by_conn: HashMap::new(),
            }),
            store,
            policy: FlushPolicy::new(flush_interval),
            metrics: RelayMetrics::default(),
            max_waiting,
        }
    }

    pub fn store(&self) -> &SegmentStore {
        &self.store
    }

    pub fn metrics(&self) -> &RelayMetrics {
        &self.metrics
    }

    /// Register a freshly accepted connection and attempt pairing.
    ///
    /// Clients receive an immediate `waiting` acknowledgment; operators are
    /// not separately acknowledged. If the acknowledgment cannot be
    /// delivered the peer is never enqueued.
    pub fn connect(&self, role: Role, link: Arc<dyn PeerLink>) -> Result<ConnId, ConnectError> {
        let mut inner = self.inner.lock().unwrap();

        let queued = match role {
            Role::Client => inner.waiting_clients.len(),
            Role::Operator => inner.waiting_operators.len(),
        };
        if queued >= self.max_waiting {
            warn!(%role, queued, "Waiting queue at capacity, refusing connection");
            return Err(ConnectError::AtCapacity);
        }

        if role == Role::Client
            && link.send_control(&ControlMessage::Waiting).is_err()
        {
            return Err(ConnectError::PeerGone);
        }

        let conn_id = ConnId::new();
        inner.links.insert(conn_id, link);
        match role {
            Role::Client => inner.waiting_clients.push_back(conn_id),
            Role::Operator => inner.waiting_operators.push_back(conn_id),
        }
        info!(%conn_id, %role, queued = queued + 1, "Peer enqueued");

        self.try_pair(&mut inner);
        Ok(conn_id)
    }

    /// Pair queue heads while both queues are non-empty, strictly FIFO.
    ///
    /// Notification failure rolls the pairing back: both peers return to
    /// the front of their queues, the half-built session is discarded, and
    /// pairing stops for this invocation. The dead peer's own disconnect
    /// will unblock the queue.
    fn try_pair(&self, inner: &mut RegistryInner) {
        while !inner.waiting_clients.is_empty() && !inner.waiting_operators.is_empty() {
            let client_id = match inner.waiting_clients.pop_front() {
                Some(id) => id,
                None => break,
            };
            let operator_id = match inner.waiting_operators.pop_front() {
                Some(id) => id,
                None => {
                    inner.waiting_clients.push_front(client_id);
                    break;
                }
            };
            let (client_link, operator_link) = match (
                inner.links.get(&client_id).cloned(),
                inner.links.get(&operator_id).cloned(),
            ) {
                (Some(c), Some(o)) => (c, o),
                // A queued id without a link cannot happen; bail out rather
                // than pair against a phantom.
                _ => {
                    inner.waiting_clients.push_front(client_id);
                    inner.waiting_operators.push_front(operator_id);
                    break;
                }
            };

            let session_id = Uuid::new_v4().to_string();
            let session = Arc::new(Session::new(
                session_id.clone(),
                Peer {
                    conn_id: client_id,
                    link: client_link.clone(),
                },
                Peer {
                    conn_id: operator_id,
                    link: operator_link.clone(),
                },
            ));
            inner.sessions.insert(session_id.clone(), session);
            inner.by_conn.insert(client_id, session_id.clone());
            inner.by_conn.insert(operator_id, session_id.clone());

            // One session-established message per peer, each carrying the
            // recipient's own role.
            let notified = client_link
                .send_control(&ControlMessage::CallConnected {
                    session_id: session_id.clone(),
                    role: Role::Client,
                })
                .and_then(|_| {
                    operator_link.send_control(&ControlMessage::ClientConnected {
                        session_id: session_id.clone(),
                        role: Role::Operator,
                    })
                });

            if notified.is_err() {
                debug!(%session_id, "Pairing notification failed, rolling back");
                inner.sessions.remove(&session_id);
                inner.by_conn.remove(&client_id);
                inner.by_conn.remove(&operator_id);
                inner.waiting_clients.push_front(client_id);
                inner.waiting_operators.push_front(operator_id);
                break;
            }

            self.metrics.pairings_total.fetch_add(1, Ordering::Relaxed);
            info!(%session_id, %client_id, %operator_id, "Session established");
        }
    }

    /// Forward one binary frame from `sender` to its counterpart, then hand
    /// the payload to the flush policy.
    ///
    /// An unpaired or already-retired sender is not an error: the frame is
    /// silently dropped. A closed counterpart routes into the lifecycle
    /// path as a disconnect of that counterpart.
    pub fn relay(&self, sender: ConnId, payload: &[u8]) {
        let session = {
            let inner = self.inner.lock().unwrap();
            inner
                .by_conn
                .get(&sender)
                .and_then(|sid| inner.sessions.get(sid))
                .cloned()
        };
        let Some(session) = session else {
            self.metrics.frames_dropped.fetch_add(1, Ordering::Relaxed);
            trace!(%sender, bytes = payload.len(), "Frame from unpaired peer dropped");
            return;
        };
        let Some(sender_role) = session.role_of(sender) else {
            return;
        };

        let dest = sender_role.counterpart();
        let counterpart = session.peer(dest);
        if counterpart.link.send_frame(payload.to_vec()).is_err() {
            debug!(
                session_id = %session.id,
                "Counterpart stream closed during forward, retiring session"
            );
            self.disconnect(counterpart.conn_id);
            return;
        }

        self.metrics.frames_relayed.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .bytes_relayed
            .fetch_add(payload.len() as u64, Ordering::Relaxed);

        match self.policy.accumulate(&session, dest, payload, &self.store) {
            Ok(Some(filename)) => {
                self.metrics.segments_written.fetch_add(1, Ordering::Relaxed);
                debug!(session_id = %session.id, %filename, "Timed flush");
            }
            Ok(None) => {}
            Err(e) => {
                self.metrics.write_failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    session_id = %session.id,
                    role = %dest,
                    error = %e,
                    "Segment write failed, bytes retained"
                );
            }
        }
    }

    /// Retire a connection: dequeue it if it was waiting, or tear down its
    /// session if it was paired.
    ///
    /// Teardown final-flushes both lanes, best-effort notifies the
    /// surviving peer, and removes the session. Calling this twice for the
    /// same connection is a no-op the second time, which is what makes the
    /// two independent detection paths (receive loop and failed forward)
    /// safe.
    pub fn disconnect(&self, conn_id: ConnId) {
        let retired = {
            let mut inner = self.inner.lock().unwrap();
            inner.links.remove(&conn_id);

            if let Some(pos) = inner.waiting_clients.iter().position(|c| *c == conn_id) {
                let _ = inner.waiting_clients.remove(pos);
                info!(%conn_id, "Waiting client left the queue");
                return;
            }
            if let Some(pos) = inner.waiting_operators.iter().position(|c| *c == conn_id) {
                let _ = inner.waiting_operators.remove(pos);
                info!(%conn_id, "Waiting operator left the queue");
                return;
            }

            let Some(session_id) = inner.by_conn.remove(&conn_id) else {
                // Unknown or already retired: the idempotent no-op path.
                return;
            };
            let Some(session) = inner.sessions.remove(&session_id) else {
                return;
            };
            let Some(gone_role) = session.role_of(conn_id) else {
                return;
            };
            let survivor_role = gone_role.counterpart();
            let survivor_id = session.peer(survivor_role).conn_id;
            inner.by_conn.remove(&survivor_id);
            // The survivor's link stays registered until its own disconnect.
            Some((session, survivor_role))
        };
        let Some((session, survivor_role)) = retired else {
            return;
        };

        // Final flush, unconditional on elapsed time, for both directions.
        for role in [Role::Client, Role::Operator] {
            match self.policy.flush(&session, role, &self.store) {
                Ok(Some(filename)) => {
                    self.metrics.segments_written.fetch_add(1, Ordering::Relaxed);
                    debug!(session_id = %session.id, %filename, "Final flush");
                }
                Ok(None) => {}
                Err(e) => {
                    self.metrics.write_failures.fetch_add(1, Ordering::Relaxed);
                    error!(
                        session_id = %session.id,
                        role = %role,
                        error = %e,
                        "Final flush failed"
                    );
                }
            }
        }

        // Best-effort: the survivor may already be tearing down on its own.
        let _ = session
            .peer(survivor_role)
            .link
            .send_control(&ControlMessage::CallEnded);

        self.metrics.sessions_ended.fetch_add(1, Ordering::Relaxed);
        info!(session_id = %session.id, %conn_id, "Session retired");
        // Segments stay on disk; cleanup is only ever an explicit purge.
    }

    /// Ids of all currently active sessions.
    pub fn active_session_ids(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner.sessions.keys().cloned().collect()
    }

    pub fn session_count(&self) -> usize {
        self.inner.lock().unwrap().sessions.len()
    }

    /// (waiting clients, waiting operators)
    pub fn waiting_counts(&self) -> (usize, usize) {
        let inner = self.inner.lock().unwrap();
        (inner.waiting_clients.len(), inner.waiting_operators.len())
    }
}
