//! # WebSocket Peer Transport
//!
//! Handles the two real-time endpoints, `/ws/client` and `/ws/operator`.
//! Each accepted connection becomes one `PeerSocket` actor that registers
//! itself with the `CallRegistry`, feeds every inbound binary frame to
//! `relay`, and reports its own termination exactly once as a disconnect.
//!
//! ## Protocol:
//! - **Peer → Server**: opaque binary audio frames (forwarded verbatim)
//! - **Server → Peer**: JSON control messages (`waiting`, `call_connected`,
//!   `client_connected`, `call_ended`) and the counterpart's binary frames
//!
//! ## Actor Model:
//! The registry reaches a peer only through its actor mailbox (`AddrLink`),
//! so outbound delivery is a non-blocking enqueue and a closed mailbox is
//! the transport-closed signal. Mailbox ordering is what preserves
//! per-sender forwarding order.

use crate::relay::message::{ControlMessage, PeerLink, SendError};
use crate::relay::registry::CallRegistry;
use crate::relay::session::{ConnId, Role};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How often the server pings an idle peer.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// How long without any pong before the connection is considered dead.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Outbound binary frame for a peer's mailbox.
#[derive(Message)]
#[rtype(result = "()")]
struct Frame(Vec<u8>);

/// Outbound control message, pre-serialized to JSON.
#[derive(Message)]
#[rtype(result = "()")]
struct Control(String);

/// The registry's view of one connected peer: its actor address.
///
/// `try_send` never blocks; it fails only when the mailbox is gone because
/// the actor stopped, which is exactly the `SendError` contract.
struct AddrLink {
    addr: Addr<PeerSocket>,
}

impl PeerLink for AddrLink {
    fn send_control(&self, message: &ControlMessage) -> Result<(), SendError> {
        let json = serde_json::to_string(message).map_err(|_| SendError)?;
        self.addr.try_send(Control(json)).map_err(|_| SendError)
    }

    fn send_frame(&self, frame: Vec<u8>) -> Result<(), SendError> {
        self.addr.try_send(Frame(frame)).map_err(|_| SendError)
    }
}

/// One live peer connection of either role.
pub struct PeerSocket {
    role: Role,
    registry: Arc<CallRegistry>,
    /// Assigned by the registry once registration succeeds.
    conn_id: Option<ConnId>,
    last_heartbeat: Instant,
}

impl PeerSocket {
    pub fn new(role: Role, registry: Arc<CallRegistry>) -> Self {
        Self {
            role,
            registry,
            conn_id: None,
            last_heartbeat: Instant::now(),
        }
    }

    /// Ping on an interval and drop peers that stopped answering.
    fn heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(role = %act.role, "Peer heartbeat timeout, closing connection");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }
}

impl Actor for PeerSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.heartbeat(ctx);

        let link = Arc::new(AddrLink {
            addr: ctx.address(),
        });
        match self.registry.connect(self.role, link) {
            Ok(conn_id) => {
                info!(%conn_id, role = %self.role, "Peer connection registered");
                self.conn_id = Some(conn_id);
            }
            Err(e) => {
                warn!(role = %self.role, error = %e, "Peer registration refused");
                ctx.stop();
            }
        }
    }

    /// Runs exactly once per connection, whatever made the actor stop, so
    /// the registry sees one disconnect event per peer.
    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Some(conn_id) = self.conn_id.take() {
            self.registry.disconnect(conn_id);
            info!(%conn_id, role = %self.role, "Peer connection closed");
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for PeerSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Binary(data)) => {
                if let Some(conn_id) = self.conn_id {
                    self.registry.relay(conn_id, &data);
                }
            }
            Ok(ws::Message::Text(text)) => {
                // Peers speak binary; stray text frames are logged and ignored.
                debug!(role = %self.role, len = text.len(), "Ignoring text frame");
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                debug!(role = %self.role, ?reason, "Peer sent close");
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) | Ok(ws::Message::Nop) => {}
            Err(e) => {
                warn!(role = %self.role, error = %e, "WebSocket protocol error");
                ctx.stop();
            }
        }
    }
}

impl Handler<Frame> for PeerSocket {
    type Result = ();

    fn handle(&mut self, msg: Frame, ctx: &mut Self::Context) {
        ctx.binary(msg.0);
    }
}

impl Handler<Control> for PeerSocket {
    type Result = ();

    fn handle(&mut self, msg: Control, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

/// `GET /ws/client` — upgrade and enter the queue as a client.
pub async fn client_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    start_peer(Role::Client, req, stream, state)
}

/// `GET /ws/operator` — upgrade and enter the queue as an operator.
pub async fn operator_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    start_peer(Role::Operator, req, stream, state)
}

fn start_peer(
    role: Role,
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!(
        %role,
        peer_addr = ?req.connection_info().realip_remote_addr(),
        "New WebSocket connection request"
    );
    ws::start(PeerSocket::new(role, state.registry.clone()), &req, stream)
}
