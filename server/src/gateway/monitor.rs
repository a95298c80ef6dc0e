//! WebSocket endpoint for monitoring subscribers

use super::device::close_with;
use super::Gateway;
use axum::extract::ws::{close_code, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tracing::{debug, info};

pub async fn monitor_ws(ws: WebSocketUpgrade, State(gateway): State<Arc<Gateway>>) -> Response {
    ws.on_upgrade(move |socket| handle_monitor(socket, gateway))
}

async fn handle_monitor(socket: WebSocket, gateway: Arc<Gateway>) {
    let (mut sink, mut stream) = socket.split();
    let (id, mut rx) = gateway.broadcaster().subscribe("ws-monitor");
    info!(subscriber = id, "Monitor connected");

    loop {
        tokio::select! {
            message = rx.recv() => {
                let Some(message) = message else {
                    // Removed by the broadcaster as a slow consumer, or on shutdown
                    close_with(&mut sink, close_code::AGAIN, "subscriber disconnected").await;
                    break;
                };
                if let Err(e) = sink.send(Message::Text(message.to_string())).await {
                    debug!(subscriber = id, error = %e, "Write to monitor failed");
                    break;
                }
            }
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    gateway.broadcaster().unsubscribe(id);
    info!(subscriber = id, "Monitor disconnected");
}
