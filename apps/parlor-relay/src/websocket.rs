use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use std::borrow::Cow;
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use parlor_proto::{Envelope, ProtocolError};

use crate::state::RelayState;

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

enum Inbound {
    Text(String),
    Violation(ProtocolError),
    Closed,
}

/// WebSocket upgrade handler
pub async fn websocket_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    State(state): State<RelayState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, remote_addr))
}

/// Drive one transport through unregistered → registered → disconnected.
async fn handle_socket(socket: WebSocket, state: RelayState, remote_addr: SocketAddr) {
    let (mut sender, mut receiver) = socket.split();

    let username = match next_frame(&mut receiver).await {
        Inbound::Text(text) => match Envelope::parse_registration(&text) {
            Ok(username) => username,
            Err(err) => {
                warn!(%remote_addr, error = %err, "rejecting unregistered transport");
                let _ = sender.send(close_message(Some(&err))).await;
                return;
            }
        },
        Inbound::Violation(err) => {
            warn!(%remote_addr, error = %err, "rejecting unregistered transport");
            let _ = sender.send(close_message(Some(&err))).await;
            return;
        }
        Inbound::Closed => {
            debug!(%remote_addr, "transport closed before registering");
            return;
        }
    };

    let (tx, rx) = mpsc::unbounded_channel::<Envelope>();
    let writer = tokio::spawn(write_envelopes(sender, rx));
    let peer_id = state.admit(&username, tx);
    debug!(%remote_addr, peer_id = %peer_id, "transport registered");

    let mut violation = None;
    loop {
        match next_frame(&mut receiver).await {
            Inbound::Text(text) => match Envelope::parse_client_frame(&text) {
                Ok(envelope) => {
                    state.route(peer_id, envelope);
                }
                Err(err) => {
                    violation = Some(err);
                    break;
                }
            },
            Inbound::Violation(err) => {
                violation = Some(err);
                break;
            }
            Inbound::Closed => break,
        }
    }

    if let Some(err) = &violation {
        warn!(peer_id = %peer_id, error = %err, "protocol violation, closing transport");
    }

    // Removing the peer drops the registry's outbox sender, which lets the
    // writer drain what is queued and hand the sink back.
    state.depart(peer_id);
    match writer.await {
        Ok(mut sender) => {
            let _ = sender.send(close_message(violation.as_ref())).await;
        }
        Err(e) => error!(peer_id = %peer_id, "writer task failed: {}", e),
    }
    debug!(peer_id = %peer_id, "transport disconnected");
}

async fn next_frame(receiver: &mut WsStream) -> Inbound {
    while let Some(frame) = receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => return Inbound::Text(text),
            Ok(Message::Binary(_)) => return Inbound::Violation(ProtocolError::BinaryFrame),
            Ok(Message::Close(_)) => return Inbound::Closed,
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Err(e) => {
                debug!("websocket read error: {}", e);
                return Inbound::Closed;
            }
        }
    }
    Inbound::Closed
}

async fn write_envelopes(mut sender: WsSink, mut rx: mpsc::UnboundedReceiver<Envelope>) -> WsSink {
    while let Some(envelope) = rx.recv().await {
        let json = match envelope.to_json() {
            Ok(json) => json,
            Err(e) => {
                error!(kind = envelope.kind(), "failed to encode envelope: {}", e);
                continue;
            }
        };
        if sender.send(Message::Text(json)).await.is_err() {
            break;
        }
    }
    sender
}

fn close_message(violation: Option<&ProtocolError>) -> Message {
    let frame = match violation {
        Some(err) => CloseFrame {
            code: close_code::PROTOCOL,
            reason: Cow::Owned(err.to_string()),
        },
        None => CloseFrame {
            code: close_code::NORMAL,
            reason: Cow::Borrowed(""),
        },
    };
    Message::Close(Some(frame))
}
