//! Individual device session state

use securex_shared::{ControlMessage, Metrics};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, Instant};

/// Lifecycle of a device session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Connecting,
    Active,
    Stale,
    Closed,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionStatus::Connecting => "connecting",
            SessionStatus::Active => "active",
            SessionStatus::Stale => "stale",
            SessionStatus::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Transport handle used to push data to one device.
///
/// The connection task owns the matching [`ChannelEndpoints`]: it drains
/// `outbound` into the socket and exits once `shutdown` flips to `true`.
pub struct DeviceChannel {
    tx: mpsc::Sender<ControlMessage>,
    shutdown: watch::Sender<bool>,
}

/// Connection-side ends of a [`DeviceChannel`]
pub struct ChannelEndpoints {
    pub outbound: mpsc::Receiver<ControlMessage>,
    pub shutdown: watch::Receiver<bool>,
}

impl ChannelEndpoints {
    /// Whether the owning session has closed the channel
    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }
}

impl DeviceChannel {
    /// Create a channel with a bounded outbound queue
    pub fn new(capacity: usize) -> (Self, ChannelEndpoints) {
        let (tx, outbound) = mpsc::channel(capacity);
        let (shutdown, shutdown_rx) = watch::channel(false);
        (
            Self { tx, shutdown },
            ChannelEndpoints {
                outbound,
                shutdown: shutdown_rx,
            },
        )
    }

    /// Signal the connection task to close the transport
    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow() || self.tx.is_closed()
    }

    pub(crate) fn sender(&self) -> mpsc::Sender<ControlMessage> {
        self.tx.clone()
    }
}

/// Identifies one registration of a device.
///
/// A device that reconnects gets a new `session_id`; teardown of the old
/// connection must not touch the new session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub device_id: String,
    pub session_id: u64,
}

/// Server-side state of one connected device
pub(crate) struct DeviceSession {
    pub device_id: String,
    pub session_id: u64,
    pub channel: DeviceChannel,
    pub status: SessionStatus,
    pub connected_at: Instant,
    /// Gateway receipt time of the last accepted telemetry; drives liveness
    pub last_seen: Instant,
    /// Largest device-embedded timestamp accepted so far
    pub last_timestamp: u64,
    pub last_metrics: Option<Metrics>,
    pub stale_since: Option<Instant>,
}

impl DeviceSession {
    pub fn new(device_id: String, session_id: u64, channel: DeviceChannel) -> Self {
        let now = Instant::now();
        Self {
            device_id,
            session_id,
            channel,
            status: SessionStatus::Connecting,
            connected_at: now,
            last_seen: now,
            last_timestamp: 0,
            last_metrics: None,
            stale_since: None,
        }
    }

    /// Record accepted telemetry. Returns the previous status.
    pub fn touch(&mut self, metrics: Metrics, timestamp: u64, now: Instant) -> SessionStatus {
        let previous = self.status;

        self.last_seen = self.last_seen.max(now);
        if timestamp >= self.last_timestamp {
            self.last_timestamp = timestamp;
            self.last_metrics = Some(metrics);
        }
        if matches!(previous, SessionStatus::Connecting | SessionStatus::Stale) {
            self.status = SessionStatus::Active;
            self.stale_since = None;
        }

        previous
    }

    pub fn mark_stale(&mut self, now: Instant) {
        if self.status != SessionStatus::Closed && self.status != SessionStatus::Stale {
            self.status = SessionStatus::Stale;
            self.stale_since = Some(now);
        }
    }

    /// Silent for at least `timeout` while still considered live
    pub fn is_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        matches!(self.status, SessionStatus::Connecting | SessionStatus::Active)
            && now.saturating_duration_since(self.last_seen) >= timeout
    }

    /// Stale for at least `grace` without recovering
    pub fn is_grace_expired(&self, now: Instant, grace: Duration) -> bool {
        self.status == SessionStatus::Stale
            && self
                .stale_since
                .is_some_and(|since| now.saturating_duration_since(since) >= grace)
    }

    /// Close the transport and mark the session closed
    pub fn close(&mut self) {
        self.status = SessionStatus::Closed;
        self.channel.close();
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            device_id: self.device_id.clone(),
            session_id: self.session_id,
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            device_id: self.device_id.clone(),
            session_id: self.session_id,
            status: self.status,
            last_metrics: self.last_metrics,
            last_timestamp: self.last_timestamp,
            idle_ms: self.last_seen.elapsed().as_millis() as u64,
            connected_secs: self.connected_at.elapsed().as_secs(),
            last_seen: self.last_seen,
        }
    }
}

/// Read-only view of a session
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub device_id: String,
    pub session_id: u64,
    pub status: SessionStatus,
    pub last_metrics: Option<Metrics>,
    pub last_timestamp: u64,
    pub idle_ms: u64,
    pub connected_secs: u64,
    #[serde(skip)]
    pub last_seen: Instant,
}
