//! Axum WebSocket wiring for the push channel.
//!
//! Each connection gets two tasks: a forwarder draining the client's
//! outbound queue into the socket, and the inbound loop handling control
//! messages. Either side failing tears the connection down through
//! [`Broadcaster::disconnect`], which affects that client alone.

use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::broadcaster::Broadcaster;
use crate::protocol::{ClientMessage, ServerMessage};

#[derive(Clone)]
struct GatewayState {
    broadcaster: Broadcaster,
}

/// Build the gateway router exposing `GET /ws`.
pub fn router(broadcaster: Broadcaster) -> Router {
    Router::new()
        .route("/ws", get(push_channel_ws))
        .with_state(GatewayState { broadcaster })
}

async fn push_channel_ws(
    ws: WebSocketUpgrade,
    State(state): State<GatewayState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.broadcaster))
}

async fn handle_socket(socket: WebSocket, broadcaster: Broadcaster) {
    let client_id = Uuid::new_v4().to_string();
    let mut outbound = broadcaster.connect(&client_id);
    let (mut sender, mut receiver) = socket.split();

    // Forward queued messages (welcome included) to the socket.
    let forward = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let Ok(text) = serde_json::to_string(&message) else {
                continue;
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // Inbound control loop.
    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Subscribe { data }) => {
                    broadcaster.subscribe(&client_id, data.event_types);
                }
                Ok(ClientMessage::Ping) => {
                    trace!(client = %client_id, "ping");
                    broadcaster.send_to(&client_id, ServerMessage::pong());
                }
                Err(e) => {
                    debug!(client = %client_id, error = %e, "ignoring malformed control message");
                }
            },
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    broadcaster.disconnect(&client_id);
    forward.abort();
}
