//! SecureX Shared Protocol Types
//!
//! This crate provides the wire types, codec and signing helpers shared by the
//! PLC device client and the telemetry gateway.

pub mod access;
pub mod codec;
pub mod protocol;
pub mod signature;

use std::time::{SystemTime, UNIX_EPOCH};

// Re-export commonly used types at crate root
pub use protocol::*;

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Default operating parameters for devices and the gateway
pub mod defaults {
    /// Interval between telemetry samples on the device
    pub const TELEMETRY_INTERVAL_MS: u64 = 1000;

    /// How often the gateway sweeps sessions for liveness
    pub const SWEEP_INTERVAL_MS: u64 = 5_000;

    /// Silence after which an active session is considered stale
    pub const LIVENESS_TIMEOUT_MS: u64 = 15_000;

    /// Time a session may stay stale before it is evicted
    pub const STALE_GRACE_MS: u64 = 60_000;

    /// How long a new connection has to send its first telemetry message
    pub const HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

    /// Outbound queue depth per monitoring subscriber
    pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 256;

    /// Number of publish attempts over which a subscriber's drop ratio is measured
    pub const DROP_WINDOW: u32 = 64;

    /// Drop ratio above which a subscriber is disconnected
    pub const MAX_DROP_RATIO: f64 = 0.5;

    /// Outbound control queue depth per device
    pub const DEVICE_QUEUE_CAPACITY: usize = 32;

    /// Maximum wait for space in a device's control queue
    pub const CONTROL_WRITE_TIMEOUT_MS: u64 = 2_000;

    /// Access level required to issue control commands
    pub const CONTROL_ACCESS_LEVEL: u8 = 2;

    /// Initial device reconnect delay
    pub const RECONNECT_DELAY_MS: u64 = 5_000;

    /// Upper bound for the device reconnect backoff
    pub const MAX_RECONNECT_DELAY_MS: u64 = 60_000;

    /// Gateway listening port
    pub const GATEWAY_PORT: u16 = 3000;

    /// Shared secret used when none is configured
    pub const DEVICE_SECRET: &str = "device-secret";
}
