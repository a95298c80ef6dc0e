//! Gateway state shared by every connection task
//!
//! Owns the session registry, the broadcaster and the control dispatcher,
//! and turns raw device frames into registry updates and fan-out.

pub mod device;
pub mod monitor;

use crate::auth::{IdentityValidator, StaticTokenValidator};
use crate::broadcast::{BackpressurePolicy, Broadcaster, SubscriberStats};
use crate::command::ControlDispatcher;
use crate::config::GatewayConfig;
use crate::error::IngestError;
use crate::session::{ChannelEndpoints, DeviceChannel, SessionHandle, SessionRegistry};
use securex_shared::codec::decode_device_message;
use securex_shared::{DeviceMessage, TelemetryMessage};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// What an accepted device frame turned out to be
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ingested {
    Telemetry,
    ControlAck,
}

/// Point-in-time view served by `/health`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub status: &'static str,
    pub subscribers: usize,
    pub active_sessions: usize,
    pub stale_sessions: usize,
    pub devices: usize,
    pub uptime_secs: u64,
    pub telemetry_accepted: u64,
    pub invalid_signatures: u64,
    pub rejected_messages: u64,
    pub messages_published: u64,
    pub controls_dispatched: u64,
    pub controls_failed: u64,
    pub monitors: Vec<SubscriberStats>,
}

#[derive(Default)]
struct IngestCounters {
    accepted: AtomicU64,
    invalid_signatures: AtomicU64,
    rejected: AtomicU64,
}

pub struct Gateway {
    registry: Arc<SessionRegistry>,
    broadcaster: Arc<Broadcaster>,
    dispatcher: ControlDispatcher,
    validator: Arc<dyn IdentityValidator>,
    secret: Vec<u8>,
    handshake_timeout: Duration,
    device_queue_capacity: usize,
    control_access_level: u8,
    started_at: Instant,
    counters: IngestCounters,
}

impl Gateway {
    pub fn new(config: &GatewayConfig) -> Self {
        let validator = Arc::new(StaticTokenValidator::new(&config.auth.tokens));
        Self::with_validator(config, validator)
    }

    pub fn with_validator(config: &GatewayConfig, validator: Arc<dyn IdentityValidator>) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let broadcaster = Arc::new(Broadcaster::new(BackpressurePolicy::from(&config.broadcast)));
        let dispatcher = ControlDispatcher::new(registry.clone(), config.control.write_timeout());

        Self {
            registry,
            broadcaster,
            dispatcher,
            validator,
            secret: config.server.device_secret.as_bytes().to_vec(),
            handshake_timeout: config.server.handshake_timeout(),
            device_queue_capacity: config.control.device_queue_capacity,
            control_access_level: config.control.required_access_level,
            started_at: Instant::now(),
            counters: IngestCounters::default(),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    pub fn dispatcher(&self) -> &ControlDispatcher {
        &self.dispatcher
    }

    pub fn validator(&self) -> &dyn IdentityValidator {
        self.validator.as_ref()
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    pub fn control_access_level(&self) -> u8 {
        self.control_access_level
    }

    /// Validate the first frame of a device connection.
    ///
    /// Nothing is registered until the frame is a correctly signed `TELEMETRY`.
    pub fn handshake(&self, text: &str) -> Result<TelemetryMessage, IngestError> {
        let message = decode_device_message(text).map_err(|e| {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            IngestError::from(e)
        })?;

        let DeviceMessage::Telemetry(telemetry) = message else {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(IngestError::HandshakeRequired);
        };

        if !telemetry.verify(&self.secret) {
            self.counters.invalid_signatures.fetch_add(1, Ordering::Relaxed);
            return Err(IngestError::InvalidSignature(telemetry.device_id));
        }

        Ok(telemetry)
    }

    /// Register a session for a device whose handshake was accepted and
    /// record the handshake telemetry
    pub fn open_session(
        &self,
        telemetry: &TelemetryMessage,
        raw: &str,
    ) -> Result<(SessionHandle, ChannelEndpoints), IngestError> {
        let (channel, ends) = DeviceChannel::new(self.device_queue_capacity);
        let handle = self.registry.register(&telemetry.device_id, channel);
        self.accept_telemetry(&handle, telemetry, raw)?;
        Ok((handle, ends))
    }

    /// Process one frame received on an established device session
    pub fn ingest(&self, handle: &SessionHandle, text: &str) -> Result<Ingested, IngestError> {
        let message = match decode_device_message(text) {
            Ok(message) => message,
            Err(e) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(e.into());
            }
        };

        if message.device_id() != handle.device_id {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(IngestError::DeviceMismatch {
                claimed: message.device_id().to_string(),
                session: handle.device_id.clone(),
            });
        }

        match message {
            DeviceMessage::Telemetry(telemetry) => {
                if !telemetry.verify(&self.secret) {
                    self.counters.invalid_signatures.fetch_add(1, Ordering::Relaxed);
                    return Err(IngestError::InvalidSignature(telemetry.device_id));
                }
                self.accept_telemetry(handle, &telemetry, text)?;
                Ok(Ingested::Telemetry)
            }
            DeviceMessage::ControlAck(ack) => {
                if ack.success {
                    info!(
                        device_id = %ack.device_id,
                        register = ack.register,
                        value = ack.value,
                        "<<< Control acknowledged"
                    );
                } else {
                    warn!(
                        device_id = %ack.device_id,
                        register = ack.register,
                        value = ack.value,
                        message = %ack.message,
                        "<<< Control failed on device"
                    );
                }
                self.broadcaster.publish(Arc::from(text));
                Ok(Ingested::ControlAck)
            }
        }
    }

    fn accept_telemetry(
        &self,
        handle: &SessionHandle,
        telemetry: &TelemetryMessage,
        raw: &str,
    ) -> Result<(), IngestError> {
        self.registry
            .touch(handle, telemetry.metrics, telemetry.timestamp)?;
        self.counters.accepted.fetch_add(1, Ordering::Relaxed);

        let report = self.broadcaster.publish(Arc::from(raw));
        debug!(
            device_id = %handle.device_id,
            cpu = telemetry.metrics.cpu,
            memory = telemetry.metrics.memory,
            temperature = telemetry.metrics.temperature,
            delivered = report.delivered,
            dropped = report.dropped,
            "Telemetry accepted"
        );
        Ok(())
    }

    pub fn health(&self) -> HealthSnapshot {
        let counts = self.registry.status_counts();
        HealthSnapshot {
            status: "ok",
            subscribers: self.broadcaster.subscriber_count(),
            active_sessions: counts.active,
            stale_sessions: counts.stale,
            devices: self.registry.count(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            telemetry_accepted: self.counters.accepted.load(Ordering::Relaxed),
            invalid_signatures: self.counters.invalid_signatures.load(Ordering::Relaxed),
            rejected_messages: self.counters.rejected.load(Ordering::Relaxed),
            messages_published: self.broadcaster.published_count(),
            controls_dispatched: self.dispatcher.dispatched_count(),
            controls_failed: self.dispatcher.failed_count(),
            monitors: self.broadcaster.stats(),
        }
    }

    /// Close every device session and monitoring subscriber
    pub fn shutdown(&self) {
        info!(
            devices = self.registry.count(),
            subscribers = self.broadcaster.subscriber_count(),
            "Closing all connections"
        );
        self.registry.close_all();
        self.broadcaster.clear();
    }
}
