//! Periodic telemetry sampling
//!
//! While connected, the sampler reads the metrics block from the PLC, signs
//! it and queues a `TELEMETRY` message for the gateway.

use crate::plc::{read_metrics, PlcLink};
use securex_shared::{now_ms, DeviceMessage, TelemetryMessage};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Settings for one sampler
#[derive(Debug, Clone)]
pub struct SamplerConfig {
    pub device_id: String,
    pub secret: Vec<u8>,
    pub interval: Duration,
}

/// Handle to a running sampler; the task stops when the handle is stopped or dropped
pub struct SamplerHandle {
    task: JoinHandle<()>,
}

impl SamplerHandle {
    pub fn stop(self) {
        self.task.abort();
        debug!("Telemetry sampler stopped");
    }
}

impl Drop for SamplerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct TelemetrySampler;

impl TelemetrySampler {
    /// Start sampling; the first sample is taken immediately
    pub fn start(
        config: SamplerConfig,
        plc: Arc<dyn PlcLink>,
        outbound: mpsc::Sender<DeviceMessage>,
    ) -> SamplerHandle {
        info!(
            device_id = %config.device_id,
            interval_ms = config.interval.as_millis() as u64,
            plc = plc.name(),
            "Telemetry sampler started"
        );
        let task = tokio::spawn(async move {
            sample_loop(config, plc, outbound).await;
        });
        SamplerHandle { task }
    }
}

async fn sample_loop(config: SamplerConfig, plc: Arc<dyn PlcLink>, outbound: mpsc::Sender<DeviceMessage>) {
    let mut ticker = interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;

        let metrics = match read_metrics(plc.as_ref()).await {
            Ok(metrics) => metrics,
            Err(e) => {
                warn!(plc = plc.name(), error = %e, "Failed to read PLC metrics");
                continue;
            }
        };

        let message = TelemetryMessage::signed(&config.device_id, metrics, now_ms(), &config.secret);
        debug!(
            cpu = metrics.cpu,
            memory = metrics.memory,
            temperature = metrics.temperature,
            "Sampled telemetry"
        );

        if outbound.send(DeviceMessage::Telemetry(message)).await.is_err() {
            debug!("Outbound channel closed, sampler exiting");
            return;
        }
    }
}
