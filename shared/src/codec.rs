//! JSON text codec for WebSocket frames
//!
//! Each WebSocket text frame carries exactly one message, so framing is left
//! to the transport. The codec only bounds frame size and maps JSON to the
//! typed protocol messages.

use serde::Serialize;
use thiserror::Error;

use crate::{DeviceMessage, GatewayMessage};

/// Maximum accepted frame size (64 KiB); telemetry frames are a few hundred bytes
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Errors that can occur during encoding/decoding
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Message too large: {0} bytes (max: {MAX_MESSAGE_SIZE})")]
    MessageTooLarge(usize),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode any protocol message into a text frame
pub fn encode<T: Serialize>(message: &T) -> Result<String, CodecError> {
    let text = serde_json::to_string(message)?;
    if text.len() > MAX_MESSAGE_SIZE {
        return Err(CodecError::MessageTooLarge(text.len()));
    }
    Ok(text)
}

/// Decode a frame received from a device
pub fn decode_device_message(text: &str) -> Result<DeviceMessage, CodecError> {
    check_size(text)?;
    Ok(serde_json::from_str(text)?)
}

/// Decode a frame received from the gateway
pub fn decode_gateway_message(text: &str) -> Result<GatewayMessage, CodecError> {
    check_size(text)?;
    Ok(serde_json::from_str(text)?)
}

fn check_size(text: &str) -> Result<(), CodecError> {
    if text.len() > MAX_MESSAGE_SIZE {
        return Err(CodecError::MessageTooLarge(text.len()));
    }
    Ok(())
}
