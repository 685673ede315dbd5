//! WebSocket signaling transport
//!
//! One socket per peer. Inbound text frames are JSON [`ClientEnvelope`]s, each
//! dispatched as its own task so a slow engine call never blocks the reader.
//! Responses and pushed events share one writer task.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use roomrelay_sfu::signaling::{ClientEnvelope, ServerMessage};
use roomrelay_sfu::{PeerEvent, PeerId, Relay};

use crate::server::AppState;

pub async fn websocket_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state.relay))
}

async fn handle_socket(socket: WebSocket, relay: Arc<Relay>) {
    let peer_id = PeerId::generate();
    let capacity = relay.config().notification_queue_capacity;

    // Events are best-effort (try_send); responses wait for queue space
    let (event_tx, mut event_rx) = mpsc::channel::<PeerEvent>(capacity);
    let (reply_tx, mut reply_rx) = mpsc::channel::<ServerMessage>(capacity);

    relay.connect(peer_id.clone(), event_tx);
    info!(peer_id = %peer_id, "WebSocket connection established");

    let (mut sink, mut stream) = socket.split();

    let writer_peer = peer_id.clone();
    let writer = tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                Some(reply) = reply_rx.recv() => reply,
                Some(event) = event_rx.recv() => ServerMessage::from(event),
                else => break,
            };
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    warn!(peer_id = %writer_peer, error = %e, "Failed to encode server message");
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(text.into())).await {
                debug!(peer_id = %writer_peer, error = %e, "Failed to send WebSocket message");
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(peer_id = %peer_id, error = %e, "WebSocket read error");
                break;
            }
        };

        let relay = Arc::clone(&relay);
        let reply_tx = reply_tx.clone();
        let peer_id = peer_id.clone();
        tokio::spawn(async move {
            if let Some(response) = dispatch(&relay, &peer_id, text.as_str()).await {
                let _ = reply_tx.send(response).await;
            }
        });
    }

    if let Some(summary) = relay.disconnect(&peer_id).await {
        info!(
            peer_id = %peer_id,
            room_id = ?summary.room_id,
            room_removed = summary.room_removed,
            "WebSocket connection closed"
        );
    }

    // The writer ends once in-flight requests finish and the session is gone
    drop(reply_tx);
    let _ = writer.await;
}

/// Handle one raw client frame; `None` means no response is owed
pub async fn dispatch(relay: &Relay, peer_id: &PeerId, raw: &str) -> Option<ServerMessage> {
    let ClientEnvelope {
        request_id,
        request,
    } = match serde_json::from_str::<ClientEnvelope>(raw) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(peer_id = %peer_id, error = %e, "Malformed signaling frame");
            return Some(ServerMessage::bad_request(
                ClientEnvelope::salvage_request_id(raw),
                e.to_string(),
            ));
        }
    };

    match relay.handle(peer_id, request).await {
        Ok(Some(reply)) => Some(ServerMessage::success(request_id, reply)),
        Ok(None) => None,
        Err(e) => Some(ServerMessage::failure(request_id, &e)),
    }
}
