//! Wire messages exchanged between devices, the gateway and monitors
//!
//! Every message is a JSON object discriminated by its `type` field:
//!
//! ```text
//! device  -> gateway : TELEMETRY, CONTROL_ACK
//! gateway -> device  : CONTROL
//! gateway -> monitor : the device's TELEMETRY text, unchanged
//! ```

use serde::{Deserialize, Serialize};

use crate::signature;

/// Metrics snapshot reported by a device
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub cpu: f64,
    pub memory: f64,
    pub temperature: f64,
}

impl Metrics {
    pub fn new(cpu: f64, memory: f64, temperature: f64) -> Self {
        Self {
            cpu,
            memory,
            temperature,
        }
    }
}

/// Signed telemetry sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryMessage {
    pub device_id: String,
    pub metrics: Metrics,
    /// Device clock, milliseconds since Unix epoch
    pub timestamp: u64,
    /// Hex HMAC-SHA256 of the canonical metrics
    pub signature: String,
}

impl TelemetryMessage {
    /// Build a telemetry message signed with the shared device secret
    pub fn signed(
        device_id: impl Into<String>,
        metrics: Metrics,
        timestamp: u64,
        secret: &[u8],
    ) -> Self {
        Self {
            device_id: device_id.into(),
            metrics,
            timestamp,
            signature: signature::sign(&metrics, secret).unwrap_or_default(),
        }
    }

    /// Check the signature against the shared device secret
    pub fn verify(&self, secret: &[u8]) -> bool {
        signature::verify(&self.metrics, &self.signature, secret)
    }
}

/// Register write requested by an operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub register: u16,
    pub value: u16,
}

impl ControlMessage {
    pub fn new(register: u16, value: u16) -> Self {
        Self { register, value }
    }
}

/// Outcome of a control command, reported back by the device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlAck {
    pub device_id: String,
    pub register: u16,
    pub value: u16,
    pub success: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl ControlAck {
    /// Create an ACK for a register write that succeeded
    pub fn succeeded(device_id: impl Into<String>, command: &ControlMessage) -> Self {
        Self {
            device_id: device_id.into(),
            register: command.register,
            value: command.value,
            success: true,
            message: String::new(),
        }
    }

    /// Create an ACK for a register write that failed
    pub fn failed(
        device_id: impl Into<String>,
        command: &ControlMessage,
        message: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            register: command.register,
            value: command.value,
            success: false,
            message: message.into(),
        }
    }
}

/// Messages a device sends to the gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DeviceMessage {
    #[serde(rename = "TELEMETRY")]
    Telemetry(TelemetryMessage),
    #[serde(rename = "CONTROL_ACK")]
    ControlAck(ControlAck),
}

impl DeviceMessage {
    /// Device id carried by the message
    pub fn device_id(&self) -> &str {
        match self {
            DeviceMessage::Telemetry(t) => &t.device_id,
            DeviceMessage::ControlAck(a) => &a.device_id,
        }
    }
}

/// Messages the gateway sends to a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GatewayMessage {
    #[serde(rename = "CONTROL")]
    Control(ControlMessage),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_telemetry_wire_shape() {
        let msg = DeviceMessage::Telemetry(TelemetryMessage::signed(
            "DEV001",
            Metrics::new(0.4, 0.5, 42.0),
            1_700_000_000_000,
            b"device-secret",
        ));
        let value = serde_json::to_value(&msg).unwrap();

        assert_eq!(value["type"], "TELEMETRY");
        assert_eq!(value["deviceId"], "DEV001");
        assert_eq!(value["metrics"]["temperature"], 42.0);
        assert_eq!(value["timestamp"], 1_700_000_000_000u64);
        assert_eq!(value["signature"].as_str().unwrap().len(), 64);
    }

    #[test]
    fn test_control_wire_shape() {
        let msg = GatewayMessage::Control(ControlMessage::new(5, 100));
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value, json!({"type": "CONTROL", "register": 5, "value": 100}));
    }

    #[test]
    fn test_parse_original_device_payload() {
        // Shape produced by the JavaScript device program
        let raw = r#"{"type":"TELEMETRY","deviceId":"DEV001","metrics":{"cpu":0.4,"memory":0.5,"temperature":42},"timestamp":1700000000000,"signature":"00"}"#;
        let msg: DeviceMessage = serde_json::from_str(raw).unwrap();
        match msg {
            DeviceMessage::Telemetry(t) => {
                assert_eq!(t.device_id, "DEV001");
                assert_eq!(t.metrics, Metrics::new(0.4, 0.5, 42.0));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_signed_message_verifies() {
        let msg = TelemetryMessage::signed("DEV001", Metrics::new(0.1, 0.2, 30.5), 1, b"k");
        assert!(msg.verify(b"k"));
        assert!(!msg.verify(b"other"));
    }

    #[test]
    fn test_ack_omits_empty_message() {
        let ack = ControlAck::succeeded("DEV001", &ControlMessage::new(5, 100));
        let value = serde_json::to_value(DeviceMessage::ControlAck(ack)).unwrap();
        assert_eq!(value["type"], "CONTROL_ACK");
        assert_eq!(value["success"], true);
        assert!(value.get("message").is_none());
    }
}
