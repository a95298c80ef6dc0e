//! Connection manager with a persistent gateway connection and automatic reconnection

use crate::config::DeviceConfig;
use anyhow::{anyhow, Result};
use futures::{SinkExt, StreamExt};
use securex_shared::codec::{decode_gateway_message, encode};
use securex_shared::{DeviceMessage, GatewayMessage};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

type GatewaySocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Events emitted by the connection manager
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Connected to the gateway
    Connected,
    /// Connection to the gateway lost
    Disconnected { reason: String },
    /// Connection attempt failed; the next attempt follows after `retry_in`
    ConnectionFailed { reason: String, retry_in: Duration },
    /// Message received from the gateway
    Received(GatewayMessage),
}

/// Manages the gateway connection for one device
pub struct ConnectionManager {
    device_id: String,
    /// Messages to send to the gateway
    outbound_tx: mpsc::Sender<DeviceMessage>,
    event_rx: mpsc::Receiver<ConnectionEvent>,
}

impl ConnectionManager {
    /// Create a connection manager and start the connection loop
    pub fn new(config: DeviceConfig) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel::<DeviceMessage>(100);
        let (event_tx, event_rx) = mpsc::channel::<ConnectionEvent>(100);
        let device_id = config.device_id.clone();

        tokio::spawn(async move {
            connection_loop(config, outbound_rx, event_tx).await;
        });

        Self {
            device_id,
            outbound_tx,
            event_rx,
        }
    }

    /// Receive the next connection event
    pub async fn recv(&mut self) -> Option<ConnectionEvent> {
        self.event_rx.recv().await
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Get a clone of the sender for outbound messages
    pub fn get_sender(&self) -> mpsc::Sender<DeviceMessage> {
        self.outbound_tx.clone()
    }
}

/// Delay before the next attempt after `current` failed
fn next_delay(current: Duration, max: Duration) -> Duration {
    std::cmp::min(current * 2, max)
}

/// Main connection loop with reconnection logic
async fn connection_loop(
    config: DeviceConfig,
    mut outbound_rx: mpsc::Receiver<DeviceMessage>,
    event_tx: mpsc::Sender<ConnectionEvent>,
) {
    let mut reconnect_delay = config.reconnect_delay;
    let connect_timeout = config.reconnect_delay.max(Duration::from_secs(5));

    loop {
        if event_tx.is_closed() {
            debug!("Event receiver dropped, stopping connection loop");
            return;
        }

        match timeout(connect_timeout, connect_async(config.server_url.as_str())).await {
            Ok(Ok((socket, _response))) => {
                reconnect_delay = config.reconnect_delay;

                // Anything queued while offline is stale; the gateway expects
                // fresh telemetry as the first frame
                let mut discarded = 0;
                while outbound_rx.try_recv().is_ok() {
                    discarded += 1;
                }
                if discarded > 0 {
                    debug!(discarded, "Dropped messages queued while offline");
                }

                let _ = event_tx.send(ConnectionEvent::Connected).await;

                let reason = match handle_connection(socket, &mut outbound_rx, &event_tx).await {
                    Ok(()) => "Gateway closed connection".to_string(),
                    Err(e) => e.to_string(),
                };
                let _ = event_tx.send(ConnectionEvent::Disconnected { reason }).await;
            }
            Ok(Err(e)) => {
                let _ = event_tx
                    .send(ConnectionEvent::ConnectionFailed {
                        reason: e.to_string(),
                        retry_in: reconnect_delay,
                    })
                    .await;
                tokio::time::sleep(reconnect_delay).await;
                reconnect_delay = next_delay(reconnect_delay, config.max_reconnect_delay);
                continue;
            }
            Err(_) => {
                let _ = event_tx
                    .send(ConnectionEvent::ConnectionFailed {
                        reason: format!("Connect to {} timed out", config.server_url),
                        retry_in: reconnect_delay,
                    })
                    .await;
                tokio::time::sleep(reconnect_delay).await;
                reconnect_delay = next_delay(reconnect_delay, config.max_reconnect_delay);
                continue;
            }
        }

        // Lost an established connection: wait the initial delay before retrying
        tokio::time::sleep(reconnect_delay).await;
    }
}

/// Handle an active connection until it fails or the gateway closes it
async fn handle_connection(
    socket: GatewaySocket,
    outbound_rx: &mut mpsc::Receiver<DeviceMessage>,
    event_tx: &mpsc::Sender<ConnectionEvent>,
) -> Result<()> {
    let (mut writer, mut reader) = socket.split();

    loop {
        tokio::select! {
            message = outbound_rx.recv() => {
                let Some(message) = message else {
                    let _ = writer.send(Message::Close(None)).await;
                    return Ok(());
                };
                let text = encode(&message)?;
                writer.send(Message::Text(text)).await?;
            }

            frame = reader.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => match decode_gateway_message(&text) {
                        Ok(message) => {
                            let _ = event_tx.send(ConnectionEvent::Received(message)).await;
                        }
                        Err(e) => warn!(error = %e, "Ignoring malformed gateway message"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        return Err(match frame {
                            Some(frame) => anyhow!("Gateway closed connection: {} {}", frame.code, frame.reason),
                            None => anyhow!("Gateway closed connection"),
                        });
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(anyhow!("Read error: {}", e)),
                    None => return Ok(()),
                }
            }
        }
    }
}
