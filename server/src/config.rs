//! Gateway configuration
//!
//! Loaded from TOML (`$GATEWAY_CONFIG`, `config/gateway.toml`, `gateway.toml`),
//! falling back to defaults. `PORT` and `DEVICE_SECRET` in the environment
//! override the file.

use anyhow::{anyhow, Result};
use securex_shared::{access::UserRecord, defaults};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub liveness: LivenessConfig,
    pub broadcast: BroadcastConfig,
    pub control: ControlConfig,
    pub auth: AuthConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// HMAC secret shared with devices
    pub device_secret: String,
    pub handshake_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: defaults::GATEWAY_PORT,
            device_secret: defaults::DEVICE_SECRET.into(),
            handshake_timeout_ms: defaults::HANDSHAKE_TIMEOUT_MS,
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.bind, self.port)
            .parse()
            .map_err(|e| anyhow!("Invalid bind address {}:{}: {}", self.bind, self.port, e))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    pub sweep_interval_ms: u64,
    pub timeout_ms: u64,
    pub grace_ms: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: defaults::SWEEP_INTERVAL_MS,
            timeout_ms: defaults::LIVENESS_TIMEOUT_MS,
            grace_ms: defaults::STALE_GRACE_MS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    pub queue_capacity: usize,
    pub drop_window: u32,
    pub max_drop_ratio: f64,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            queue_capacity: defaults::SUBSCRIBER_QUEUE_CAPACITY,
            drop_window: defaults::DROP_WINDOW,
            max_drop_ratio: defaults::MAX_DROP_RATIO,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub device_queue_capacity: usize,
    pub write_timeout_ms: u64,
    pub required_access_level: u8,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            device_queue_capacity: defaults::DEVICE_QUEUE_CAPACITY,
            write_timeout_ms: defaults::CONTROL_WRITE_TIMEOUT_MS,
            required_access_level: defaults::CONTROL_ACCESS_LEVEL,
        }
    }
}

impl ControlConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// Pre-validated bearer tokens issued by the external auth service
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub tokens: Vec<TokenEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenEntry {
    pub token: String,
    #[serde(flatten)]
    pub user: UserRecord,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| anyhow!("Failed to read config file: {}", e))?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self> {
        let config: GatewayConfig =
            toml::from_str(content).map_err(|e| anyhow!("Failed to parse config: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `$GATEWAY_CONFIG` or the first default location found,
    /// falling back to defaults, then apply environment overrides.
    ///
    /// A file that exists but cannot be loaded is an error, as is a
    /// `$GATEWAY_CONFIG` that points nowhere.
    pub fn load_or_default() -> Result<Self> {
        let explicit = std::env::var_os("GATEWAY_CONFIG").map(PathBuf::from);
        let fallbacks = [
            PathBuf::from("config").join("gateway.toml"),
            PathBuf::from("gateway.toml"),
        ];

        let mut config = Self::load_first(explicit.as_deref(), &fallbacks)?;
        config.apply_env();
        Ok(config)
    }

    fn load_first(explicit: Option<&Path>, fallbacks: &[PathBuf]) -> Result<Self> {
        if let Some(path) = explicit {
            if !path.exists() {
                return Err(anyhow!("GATEWAY_CONFIG points to missing file {}", path.display()));
            }
            return Self::load_logged(path);
        }

        match fallbacks.iter().find(|path| path.exists()) {
            Some(path) => Self::load_logged(path),
            None => {
                info!("No config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    fn load_logged(path: &Path) -> Result<Self> {
        let config = Self::load(path).map_err(|e| anyhow!("{}: {}", path.display(), e))?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(port) = std::env::var("PORT") {
            match port.parse() {
                Ok(port) => self.server.port = port,
                Err(_) => warn!("Ignoring invalid PORT value: {}", port),
            }
        }
        if let Ok(secret) = std::env::var("DEVICE_SECRET") {
            self.server.device_secret = secret;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.liveness.timeout_ms == 0 || self.liveness.sweep_interval_ms == 0 {
            return Err(anyhow!("liveness intervals must be non-zero"));
        }
        if self.broadcast.queue_capacity == 0 || self.control.device_queue_capacity == 0 {
            return Err(anyhow!("queue capacities must be non-zero"));
        }
        if !(0.0..=1.0).contains(&self.broadcast.max_drop_ratio) {
            return Err(anyhow!("max_drop_ratio must be within 0.0..=1.0"));
        }
        Ok(())
    }
}
