mod config;
mod connection;
mod control;
mod plc;
mod telemetry;

use config::DeviceConfig;
use connection::{ConnectionEvent, ConnectionManager};
use control::ControlExecutor;
use plc::{ModbusTcpLink, PlcLink, SimulatedPlc};
use securex_shared::{DeviceMessage, GatewayMessage};
use std::sync::Arc;
use telemetry::{SamplerConfig, SamplerHandle, TelemetrySampler};

use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let config = DeviceConfig::from_env()?;

    info!("PLC device starting: {}", config.device_id);
    info!("  Gateway: {}", config.server_url);

    let plc: Arc<dyn PlcLink> = match &config.plc_addr {
        Some(addr) => {
            info!("  PLC: Modbus TCP {} (unit {})", addr, config.plc_unit_id);
            Arc::new(ModbusTcpLink::new(addr.clone(), config.plc_unit_id))
        }
        None => {
            info!("  PLC: simulated");
            Arc::new(SimulatedPlc::new())
        }
    };

    let sampler_config = SamplerConfig {
        device_id: config.device_id.clone(),
        secret: config.device_secret.as_bytes().to_vec(),
        interval: config.telemetry_interval,
    };
    let executor = ControlExecutor::new(config.device_id.clone(), plc.clone());
    let mut conn = ConnectionManager::new(config);
    let mut sampler: Option<SamplerHandle> = None;

    // Main event loop
    loop {
        let event = tokio::select! {
            event = conn.recv() => event,
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
        };

        match event {
            Some(ConnectionEvent::Connected) => {
                info!("Connected to gateway as {}", conn.device_id());
                if let Some(previous) = sampler.take() {
                    previous.stop();
                }
                sampler = Some(TelemetrySampler::start(
                    sampler_config.clone(),
                    plc.clone(),
                    conn.get_sender(),
                ));
            }
            Some(ConnectionEvent::Disconnected { reason }) => {
                warn!("Disconnected: {}", reason);
                if let Some(handle) = sampler.take() {
                    handle.stop();
                }
            }
            Some(ConnectionEvent::ConnectionFailed { reason, retry_in }) => {
                error!("Connection failed: {} (retry in {:?})", reason, retry_in);
            }
            Some(ConnectionEvent::Received(GatewayMessage::Control(command))) => {
                debug!("Received CONTROL register={} value={}", command.register, command.value);
                let executor = executor.clone();
                let sender = conn.get_sender();
                tokio::spawn(async move {
                    let ack = executor.execute(&command).await;
                    if sender.send(DeviceMessage::ControlAck(ack)).await.is_err() {
                        error!("Failed to send CONTROL_ACK: connection closed");
                    }
                });
            }
            None => {
                error!("Connection manager closed");
                break;
            }
        }
    }

    if let Some(handle) = sampler.take() {
        handle.stop();
    }
    info!("PLC device stopped");
    Ok(())
}
