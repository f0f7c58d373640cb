//! # WebSocket Gateway Endpoint
//!
//! Clients connect to `/ws` and stream binary audio frames; the gateway streams the
//! upstream's audio back as binary frames on the same socket.
//!
//! ## How a connection is wired:
//! 1. **Admission**: the handler refuses the upgrade with 503 while draining or when the
//!    session limit is reached
//! 2. **Actor**: a `GatewaySocket` actor owns the socket. It forwards every client frame
//!    into the session's inbound channel and writes every frame the session queues
//! 3. **Session**: a `GatewaySession` is spawned next to the actor and runs the
//!    read/dispatch/keepalive pipeline over those two channels
//!
//! ## Message Format:
//! - **Client → Server**: binary audio (16-bit PCM or μ-law), optional JSON text frames
//! - **Server → Client**: binary audio, pings, and a close frame when the session ends
//!
//! ## Lifetime:
//! - The actor stops when the session drops its outbound sender
//! - The session sees the inbound channel close when the actor stops

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::error::TransportError;
use crate::session::{ClientFrame, ClientLink, CloseFrame, GatewaySession, InboundFrame, OutboundFrame};
use crate::state::AppState;

type InboundSender = mpsc::Sender<InboundFrame>;

/// Socket-side half of one client session.
///
/// ## Actor Model:
/// Each WebSocket connection is one actor. It never interprets audio itself; it only
/// moves frames between the socket and the session's channels.
pub struct GatewaySocket {
    session_id: Uuid,
    inbound: InboundSender,
    /// Taken in `started` and attached to the actor's context as a stream
    outbound: Option<mpsc::Receiver<OutboundFrame>>,
}

impl GatewaySocket {
    pub fn new(
        session_id: Uuid,
        inbound: InboundSender,
        outbound: mpsc::Receiver<OutboundFrame>,
    ) -> Self {
        Self {
            session_id,
            inbound,
            outbound: Some(outbound),
        }
    }

    /// Hand a frame to the session; stop the socket if the session is gone.
    ///
    /// When the session's inbound queue is full the actor waits for room before it
    /// handles anything else, so no more frames are read off the client socket.
    fn forward(&self, frame: InboundFrame, ctx: &mut ws::WebsocketContext<Self>) {
        match self.inbound.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(frame)) => {
                trace!(session_id = %self.session_id, "Session queue full, pausing socket reads");
                let inbound = self.inbound.clone();
                ctx.wait(
                    async move { inbound.send(frame).await.is_ok() }
                        .into_actor(self)
                        .map(|delivered, act, ctx| {
                            if !delivered {
                                debug!(session_id = %act.session_id, "Session ended, stopping socket");
                                ctx.stop();
                            }
                        }),
                );
            }
            Err(TrySendError::Closed(_)) => {
                debug!(session_id = %self.session_id, "Session ended, stopping socket");
                ctx.stop();
            }
        }
    }
}

impl Actor for GatewaySocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        if let Some(outbound) = self.outbound.take() {
            ctx.add_stream(ReceiverStream::new(outbound));
        }
        info!(session_id = %self.session_id, "WebSocket connection established");
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(session_id = %self.session_id, "WebSocket connection closed");
    }
}

/// Frames arriving from the client.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for GatewaySocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Binary(data)) => {
                self.forward(Ok(ClientFrame::Binary(data.to_vec())), ctx);
            }
            Ok(ws::Message::Text(text)) => {
                self.forward(Ok(ClientFrame::Text(text.to_string())), ctx);
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.forward(Ok(ClientFrame::Ping(data.to_vec())), ctx);
            }
            Ok(ws::Message::Pong(data)) => {
                self.forward(Ok(ClientFrame::Pong(data.to_vec())), ctx);
            }
            Ok(ws::Message::Close(reason)) => {
                debug!(session_id = %self.session_id, ?reason, "Client sent close");
                self.forward(Ok(ClientFrame::Close(reason.clone().map(close_frame_from))), ctx);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                // Fragmented messages are not part of the protocol
                warn!(session_id = %self.session_id, "Ignoring continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                warn!(session_id = %self.session_id, error = %err, "WebSocket protocol error");
                self.forward(Err(TransportError::Protocol(err.to_string())), ctx);
                ctx.stop();
            }
        }
    }
}

/// Frames the session wants written to the client.
impl StreamHandler<OutboundFrame> for GatewaySocket {
    fn handle(&mut self, frame: OutboundFrame, ctx: &mut Self::Context) {
        match frame {
            OutboundFrame::Binary(data) => ctx.binary(data),
            OutboundFrame::Ping(data) => ctx.ping(&data),
            OutboundFrame::Close(frame) => {
                ctx.close(frame.map(close_reason_from));
                ctx.stop();
            }
        }
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        // The session dropped its sender
        ctx.stop();
    }
}

pub fn close_frame_from(reason: ws::CloseReason) -> CloseFrame {
    CloseFrame {
        code: reason.code.into(),
        reason: reason.description.unwrap_or_default(),
    }
}

pub fn close_reason_from(frame: CloseFrame) -> ws::CloseReason {
    ws::CloseReason {
        code: ws::CloseCode::from(frame.code),
        description: (!frame.reason.is_empty()).then_some(frame.reason),
    }
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// Admission is checked before the upgrade, so a refused client gets a plain JSON 503.
/// The session task runs on the same worker as the socket actor and under a child of
/// the process-wide shutdown token.
pub async fn gateway_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    state.admit_session()?;

    let session_id = Uuid::new_v4();
    info!(
        session_id = %session_id,
        peer = ?req.connection_info().peer_addr(),
        "New WebSocket connection request"
    );

    let capacity = state.config.session.queue_capacity.max(1);
    let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
    let (outbound_tx, outbound_rx) = mpsc::channel(capacity);

    let socket = GatewaySocket::new(session_id, inbound_tx, outbound_rx);
    let response = ws::start(socket, &req, stream)?;

    let session = GatewaySession::new(session_id, &state.shutdown, state.session_context());
    actix_web::rt::spawn(async move {
        let link = ClientLink {
            inbound: inbound_rx,
            outbound: outbound_tx,
        };
        // The session logs its own outcome
        if let Err(err) = session.run(link).await {
            debug!(session_id = %session_id, error = %err, "Session task finished with error");
        }
    });

    Ok(response)
}
