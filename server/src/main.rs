mod api;
mod auth;
mod broadcast;
mod command;
mod config;
mod error;
mod gateway;
mod liveness;
mod session;

use anyhow::Context;
use config::GatewayConfig;
use gateway::Gateway;
use liveness::{LivenessPolicy, LivenessSweeper};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, reload, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Start at RUST_LOG or info so config loading is logged; the configured
    // level replaces the default once the file is read, RUST_LOG still wins
    let from_env = EnvFilter::try_from_default_env().ok();
    let has_env_filter = from_env.is_some();
    let (filter, filter_handle) = reload::Layer::new(from_env.unwrap_or_else(|| EnvFilter::new("info")));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();

    let config = GatewayConfig::load_or_default()?;
    if !has_env_filter {
        filter_handle
            .reload(EnvFilter::new(&config.logging.level))
            .context("Failed to apply configured log level")?;
    }

    let addr = config.server.socket_addr()?;
    let gateway = Arc::new(Gateway::new(&config));
    if config.auth.tokens.is_empty() {
        warn!("No API tokens configured; REST control is unavailable");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = LivenessSweeper::new(gateway.registry().clone(), LivenessPolicy::from(&config.liveness));
    let sweeper_task = tokio::spawn(async move { sweeper.run(shutdown_rx).await });

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Telemetry gateway listening on {}", addr);

    let shutdown_gateway = gateway.clone();
    axum::serve(listener, api::router(gateway))
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Shutdown requested");
            shutdown_tx.send_replace(true);
            shutdown_gateway.shutdown();
        })
        .await
        .context("Gateway server failed")?;

    if let Err(e) = sweeper_task.await {
        warn!("Liveness sweeper ended abnormally: {}", e);
    }
    info!("Telemetry gateway stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use securex_shared::codec::{decode_gateway_message, encode};
    use securex_shared::{ControlMessage, DeviceMessage, GatewayMessage, Metrics, TelemetryMessage};
    use std::net::SocketAddr;
    use tokio::time::{timeout, Duration};
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message;

    async fn start() -> (Arc<Gateway>, SocketAddr) {
        start_with(GatewayConfig::default()).await
    }

    async fn start_with(config: GatewayConfig) -> (Arc<Gateway>, SocketAddr) {
        let gateway = Arc::new(Gateway::new(&config));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = api::router(gateway.clone());
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (gateway, addr)
    }

    fn telemetry(device_id: &str, timestamp: u64, secret: &[u8]) -> String {
        encode(&DeviceMessage::Telemetry(TelemetryMessage::signed(
            device_id,
            Metrics::new(0.4, 0.5, 42.0),
            timestamp,
            secret,
        )))
        .unwrap()
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..100 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    #[tokio::test]
    async fn test_device_to_monitor_end_to_end() {
        let (gateway, addr) = start().await;

        let (mut monitor, _) = connect_async(format!("ws://{}/ws/monitor", addr)).await.unwrap();
        wait_for(|| gateway.broadcaster().subscriber_count() == 1).await;

        let (mut device, _) = connect_async(format!("ws://{}/ws/device", addr)).await.unwrap();
        let text = telemetry("DEV001", 1_700_000_000_000, b"device-secret");
        device.send(Message::Text(text.clone())).await.unwrap();

        let received = timeout(Duration::from_secs(2), monitor.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(received, Message::Text(text));

        // Control path: dispatch reaches the device socket
        gateway
            .dispatcher()
            .dispatch("DEV001", ControlMessage::new(5, 100))
            .await
            .unwrap();
        let frame = timeout(Duration::from_secs(2), device.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let Message::Text(frame) = frame else {
            panic!("expected text frame, got {:?}", frame);
        };
        assert_eq!(
            decode_gateway_message(&frame).unwrap(),
            GatewayMessage::Control(ControlMessage::new(5, 100))
        );

        // Closing the socket evicts the session
        device.close(None).await.unwrap();
        wait_for(|| gateway.registry().get("DEV001").is_none()).await;
    }

    #[tokio::test]
    async fn test_bad_handshake_closes_socket() {
        let (gateway, addr) = start().await;

        let (mut device, _) = connect_async(format!("ws://{}/ws/device", addr)).await.unwrap();
        device
            .send(Message::Text(telemetry("DEV001", 1, b"wrong-secret")))
            .await
            .unwrap();

        let frame = timeout(Duration::from_secs(2), device.next()).await.unwrap();
        assert!(matches!(frame, Some(Ok(Message::Close(_))) | None | Some(Err(_))));
        assert_eq!(gateway.registry().count(), 0);
        assert_eq!(gateway.health().invalid_signatures, 1);
    }

    #[tokio::test]
    async fn test_silent_device_closed_after_handshake_timeout() {
        let mut config = GatewayConfig::default();
        config.server.handshake_timeout_ms = 50;
        let (gateway, addr) = start_with(config).await;

        let (mut device, _) = connect_async(format!("ws://{}/ws/device", addr)).await.unwrap();

        let frame = timeout(Duration::from_secs(2), device.next())
            .await
            .expect("gateway did not close a silent device");
        let Some(Ok(Message::Close(Some(close)))) = frame else {
            panic!("expected close frame, got {:?}", frame);
        };
        assert_eq!(u16::from(close.code), 1008);
        assert_eq!(close.reason, "handshake timeout");
        assert_eq!(gateway.registry().count(), 0);
    }

    #[tokio::test]
    async fn test_reconnect_replaces_session() {
        let (gateway, addr) = start().await;
        let url = format!("ws://{}/ws/device", addr);

        let (mut first, _) = connect_async(url.as_str()).await.unwrap();
        first.send(Message::Text(telemetry("DEV001", 1, b"device-secret"))).await.unwrap();
        wait_for(|| gateway.registry().get("DEV001").is_some()).await;
        let old_session = gateway.registry().get("DEV001").unwrap().session_id;

        let (mut second, _) = connect_async(url.as_str()).await.unwrap();
        second.send(Message::Text(telemetry("DEV001", 2, b"device-secret"))).await.unwrap();
        wait_for(|| {
            gateway
                .registry()
                .get("DEV001")
                .is_some_and(|s| s.session_id != old_session)
        })
        .await;

        // Old connection is closed by the gateway; the new session survives its teardown
        let closed = timeout(Duration::from_secs(2), async {
            loop {
                match first.next().await {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await;
        assert!(closed.is_ok());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let current = gateway.registry().get("DEV001").unwrap();
        assert_ne!(current.session_id, old_session);
        assert_eq!(gateway.registry().count(), 1);
    }
}
