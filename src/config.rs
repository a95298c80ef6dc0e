//! Device client configuration from the environment

use anyhow::{anyhow, Result};
use securex_shared::defaults;
use std::time::Duration;

/// Configuration for the device client
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub device_id: String,
    /// Gateway device endpoint
    pub server_url: String,
    /// HMAC secret shared with the gateway
    pub device_secret: String,
    /// Modbus TCP address of the PLC; `None` uses the simulated PLC
    pub plc_addr: Option<String>,
    pub plc_unit_id: u8,
    pub telemetry_interval: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_id: "DEV001".into(),
            server_url: format!("ws://127.0.0.1:{}/ws/device", defaults::GATEWAY_PORT),
            device_secret: defaults::DEVICE_SECRET.into(),
            plc_addr: None,
            plc_unit_id: 1,
            telemetry_interval: Duration::from_millis(defaults::TELEMETRY_INTERVAL_MS),
            reconnect_delay: Duration::from_millis(defaults::RECONNECT_DELAY_MS),
            max_reconnect_delay: Duration::from_millis(defaults::MAX_RECONNECT_DELAY_MS),
        }
    }
}

impl DeviceConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys keep their defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(id) = lookup("DEVICE_ID") {
            config.device_id = id;
        }
        if let Some(url) = lookup("SERVER_URL") {
            config.server_url = url;
        }
        if let Some(secret) = lookup("DEVICE_SECRET") {
            config.device_secret = secret;
        }
        config.plc_addr = lookup("PLC_ADDR").filter(|addr| !addr.is_empty());
        if let Some(unit) = lookup("PLC_UNIT_ID") {
            config.plc_unit_id = unit
                .parse()
                .map_err(|e| anyhow!("Invalid PLC_UNIT_ID {:?}: {}", unit, e))?;
        }
        if let Some(ms) = lookup("TELEMETRY_INTERVAL_MS") {
            let ms: u64 = ms
                .parse()
                .map_err(|e| anyhow!("Invalid TELEMETRY_INTERVAL_MS {:?}: {}", ms, e))?;
            if ms == 0 {
                return Err(anyhow!("TELEMETRY_INTERVAL_MS must be non-zero"));
            }
            config.telemetry_interval = Duration::from_millis(ms);
        }

        if config.device_id.is_empty() {
            return Err(anyhow!("DEVICE_ID must not be empty"));
        }
        Ok(config)
    }
}
