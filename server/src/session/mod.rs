//! Session management for tracking connected devices
//!
//! This module handles:
//! - One session per device id, replaced atomically on reconnect
//! - Per-device liveness and last-known metrics
//! - Closing the transport when a session is evicted

mod connection;
mod registry;

pub use connection::{ChannelEndpoints, DeviceChannel, SessionHandle, SessionSnapshot, SessionStatus};
pub use registry::{LivenessTransition, SessionRegistry, StatusCounts};
