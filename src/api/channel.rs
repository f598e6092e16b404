// Upstream channel endpoint - the automation layer connects here over WebSocket

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::AppState;
use crate::proxy::registry::ConnectionRegistry;

pub async fn channel_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let registry = state.orchestrator.registry().clone();
    ws.on_upgrade(move |socket| serve_channel(socket, registry))
}

/// Register the socket as a channel and pump frames both ways until either
/// side goes away. Dropping the registry's sender (on `close_all`) also ends
/// the connection.
pub async fn serve_channel(socket: WebSocket, registry: Arc<ConnectionRegistry>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let channel_id = registry.add_channel(tx);
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let mut egress = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_sender.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    let inbound = registry.clone();
    let mut ingress = tokio::spawn(async move {
        while let Some(message) = ws_receiver.next().await {
            match message {
                Ok(Message::Text(text)) => inbound.route_inbound(&text),
                Ok(Message::Binary(data)) => match std::str::from_utf8(&data) {
                    Ok(text) => inbound.route_inbound(text),
                    Err(_) => tracing::warn!("Ignoring non-UTF-8 binary frame from upstream channel"),
                },
                Ok(Message::Close(_)) | Err(_) => break,
                // axum answers pings itself
                Ok(_) => {}
            }
        }
    });

    tokio::select! {
        _ = &mut ingress => { egress.abort(); }
        _ = &mut egress => { ingress.abort(); }
    }

    registry.remove_channel(channel_id);
}
