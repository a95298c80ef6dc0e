//! Gateway error taxonomy

use securex_shared::codec::CodecError;
use thiserror::Error;

/// Errors from session registry operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Unknown device: {0}")]
    UnknownDevice(String),
}

/// Errors surfaced to callers of the control dispatcher.
///
/// Every variant except `DeviceNotConnected` is a dispatch failure: the
/// session existed and was active, but the command could not be delivered.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Device not connected: {0}")]
    DeviceNotConnected(String),

    #[error("Channel to device {0} is closed")]
    ChannelClosed(String),

    #[error("Timed out writing to device {0}")]
    WriteTimeout(String),
}

/// Reasons an inbound device frame was not accepted
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Malformed message: {0}")]
    Codec(#[from] CodecError),

    #[error("First message must be TELEMETRY")]
    HandshakeRequired,

    #[error("Invalid signature from {0}")]
    InvalidSignature(String),

    #[error("Message for {claimed} arrived on the session of {session}")]
    DeviceMismatch { claimed: String, session: String },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}
