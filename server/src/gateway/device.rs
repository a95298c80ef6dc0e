//! WebSocket endpoint for devices

use super::Gateway;
use crate::session::{ChannelEndpoints, SessionHandle, SessionRegistry};
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::stream::SplitStream;
use futures::{Sink, SinkExt, StreamExt};
use securex_shared::codec::encode;
use securex_shared::{ControlMessage, GatewayMessage};
use std::borrow::Cow;
use std::fmt::Display;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, warn};

/// How long the writer gets to flush a close frame after its session ends
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

pub async fn device_ws(ws: WebSocketUpgrade, State(gateway): State<Arc<Gateway>>) -> Response {
    ws.on_upgrade(move |socket| handle_device(socket, gateway))
}

async fn handle_device(socket: WebSocket, gateway: Arc<Gateway>) {
    let (mut sink, mut stream) = socket.split();

    let first = match timeout(gateway.handshake_timeout(), next_text(&mut stream)).await {
        Ok(Some(text)) => text,
        Ok(None) => {
            debug!("Device disconnected before handshake");
            return;
        }
        Err(_) => {
            warn!("Device handshake timed out");
            close_with(&mut sink, close_code::POLICY, "handshake timeout").await;
            return;
        }
    };

    let telemetry = match gateway.handshake(&first) {
        Ok(telemetry) => telemetry,
        Err(e) => {
            warn!(error = %e, "Rejected device handshake");
            close_with(&mut sink, close_code::POLICY, "invalid handshake").await;
            return;
        }
    };

    let (handle, ends) = match gateway.open_session(&telemetry, &first) {
        Ok(session) => session,
        Err(e) => {
            error!(device_id = %telemetry.device_id, error = %e, "Failed to open session");
            close_with(&mut sink, close_code::ERROR, "session unavailable").await;
            return;
        }
    };
    info!(device_id = %handle.device_id, session_id = handle.session_id, "Device connected");

    let ChannelEndpoints { outbound, shutdown } = ends;
    let mut writer = tokio::spawn(write_loop(
        sink,
        outbound,
        shutdown.clone(),
        gateway.registry().clone(),
        handle.clone(),
    ));

    read_loop(&gateway, &handle, &mut stream, shutdown).await;

    gateway.registry().remove_session(&handle);
    if timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }
    info!(device_id = %handle.device_id, session_id = handle.session_id, "Device connection closed");
}

async fn read_loop(
    gateway: &Gateway,
    handle: &SessionHandle,
    stream: &mut SplitStream<WebSocket>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            frame = next_text(stream) => {
                let Some(text) = frame else {
                    debug!(device_id = %handle.device_id, "Device stream ended");
                    break;
                };
                if let Err(e) = gateway.ingest(handle, &text) {
                    warn!(device_id = %handle.device_id, error = %e, "Dropped device message");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!(device_id = %handle.device_id, "Session closed by gateway");
                    break;
                }
            }
        }
    }
}

/// Forward queued control messages to the device; a failed write marks the session stale
async fn write_loop<S>(
    mut sink: S,
    mut outbound: mpsc::Receiver<ControlMessage>,
    mut shutdown: watch::Receiver<bool>,
    registry: Arc<SessionRegistry>,
    handle: SessionHandle,
) where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    loop {
        tokio::select! {
            command = outbound.recv() => {
                let Some(command) = command else { break };
                let text = match encode(&GatewayMessage::Control(command)) {
                    Ok(text) => text,
                    Err(e) => {
                        error!(device_id = %handle.device_id, error = %e, "Failed to encode control");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text)).await {
                    warn!(device_id = %handle.device_id, error = %e, "Write to device failed");
                    registry.mark_stale(&handle);
                    return;
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    close_with(&mut sink, close_code::NORMAL, "session closed").await;
}

/// Next text frame; `None` once the peer is gone
async fn next_text(stream: &mut SplitStream<WebSocket>) -> Option<String> {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => return Some(text),
            Ok(Message::Close(_)) => return None,
            Ok(Message::Binary(_)) => debug!("Ignoring binary frame"),
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Err(e) => {
                debug!(error = %e, "WebSocket read error");
                return None;
            }
        }
    }
    None
}

pub(super) async fn close_with<S>(sink: &mut S, code: u16, reason: &'static str)
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let frame = CloseFrame {
        code,
        reason: Cow::Borrowed(reason),
    };
    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
        debug!(error = %e, "Failed to send close frame");
    }
}
