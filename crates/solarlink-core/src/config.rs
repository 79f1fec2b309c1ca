//! Device configuration
//!
//! A device is described by a small JSON document:
//!
//! ```json
//! {
//!   "name": "house-battery",
//!   "family": "bms",
//!   "transport": { "type": "serial", "path": "/dev/ttyUSB0" },
//!   "timing": { "min_poll_interval_ms": 1000 }
//! }
//! ```
//!
//! Missing timing fields fall back to the protocol defaults; a serial link
//! without `baud_rate` uses the family's factory rate.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::frame::framing_for;
use crate::protocol::transport::{
    AsyncHidRawTransport, AsyncSerialTransport, AsyncTcpTransport, HidRawTransport,
    SerialSettings, SerialTransport, TcpTransport,
};
use crate::protocol::{
    AsyncSession, AsyncTransport, Family, FramingStrategy, Session, SessionConfig, Transport,
    DEFAULT_ACQUIRE_TIMEOUT_MS, DEFAULT_POLL_INTERVAL_MS, DEFAULT_READ_TIMEOUT_MS,
    DEFAULT_RECEIVE_TIMEOUT_MS, DEFAULT_RETRIES, DEFAULT_WAKE_TIMEOUT_MS,
};

/// Errors raised while loading a device configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// Config file is not valid JSON for this schema
    #[error("Failed to parse config: {0}")]
    Json(#[from] serde_json::Error),

    /// Parsed but failed validation
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Physical link to a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Serial-over-TCP bridge
    Tcp {
        host: String,
        port: u16,
    },
    /// Local serial port; `baud_rate` defaults per family
    Serial {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        baud_rate: Option<u32>,
    },
    /// Linux `/dev/hidrawN` device file
    HidRaw {
        path: String,
    },
}

impl TransportConfig {
    /// Whether requests need the HID report-id prefix
    pub fn is_hid(&self) -> bool {
        matches!(self, TransportConfig::HidRaw { .. })
    }
}

/// Engine timing, all in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Minimum spacing between sends
    pub min_poll_interval_ms: u64,
    /// How long a caller waits for the session
    pub acquire_timeout_ms: u64,
    /// Single read call
    pub read_timeout_ms: u64,
    /// Whole reply
    pub receive_timeout_ms: u64,
    /// Wait after the wake frame during recovery
    pub wake_timeout_ms: u64,
    /// Send attempts per request
    pub retries: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            min_poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            acquire_timeout_ms: DEFAULT_ACQUIRE_TIMEOUT_MS,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            receive_timeout_ms: DEFAULT_RECEIVE_TIMEOUT_MS,
            wake_timeout_ms: DEFAULT_WAKE_TIMEOUT_MS,
            retries: DEFAULT_RETRIES,
        }
    }
}

/// One device: what it is, how to reach it, how fast to poll it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Label used in logs
    pub name: String,
    /// Protocol family
    pub family: Family,
    /// How to reach the device
    pub transport: TransportConfig,
    #[serde(default)]
    pub timing: TimingConfig,
}

impl DeviceConfig {
    /// Load and validate a JSON config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Parse and validate a JSON config document
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: DeviceConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize for saving
    pub fn to_json_pretty(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid("device name is empty".to_string()));
        }
        match &self.transport {
            TransportConfig::Tcp { host, port } => {
                if host.is_empty() || *port == 0 {
                    return Err(ConfigError::Invalid(format!(
                        "bad tcp endpoint {host}:{port}"
                    )));
                }
            }
            TransportConfig::Serial { path, baud_rate } => {
                if path.is_empty() {
                    return Err(ConfigError::Invalid("serial path is empty".to_string()));
                }
                if *baud_rate == Some(0) {
                    return Err(ConfigError::Invalid("baud rate must be positive".to_string()));
                }
            }
            TransportConfig::HidRaw { path } => {
                if path.is_empty() {
                    return Err(ConfigError::Invalid("hidraw path is empty".to_string()));
                }
            }
        }
        if self.timing.retries == 0 {
            return Err(ConfigError::Invalid("retries must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Serial line settings, defaulting the baud rate per family
    pub fn serial_settings(&self) -> SerialSettings {
        match self.transport {
            TransportConfig::Serial {
                baud_rate: Some(baud_rate),
                ..
            } => SerialSettings { baud_rate },
            _ => SerialSettings::for_family(self.family),
        }
    }

    /// Engine settings derived from `timing`
    pub fn session_config(&self) -> SessionConfig {
        let t = &self.timing;
        SessionConfig {
            name: self.name.clone(),
            min_poll_interval: Duration::from_millis(t.min_poll_interval_ms),
            acquire_timeout: Duration::from_millis(t.acquire_timeout_ms),
            read_timeout: Duration::from_millis(t.read_timeout_ms),
            receive_timeout: Duration::from_millis(t.receive_timeout_ms),
            wake_timeout: Duration::from_millis(t.wake_timeout_ms),
            attempts: t.retries,
        }
    }

    /// Framing for this family and link
    pub fn framing(&self) -> Box<dyn FramingStrategy> {
        framing_for(self.family, self.transport.is_hid())
    }

    /// Build the blocking channel for this device (not yet opened)
    pub fn open_transport(&self) -> Box<dyn Transport> {
        match &self.transport {
            TransportConfig::Tcp { host, port } => Box::new(TcpTransport::new(host.clone(), *port)),
            TransportConfig::Serial { path, .. } => {
                Box::new(SerialTransport::new(path.clone(), self.serial_settings()))
            }
            TransportConfig::HidRaw { path } => Box::new(HidRawTransport::new(path.clone())),
        }
    }

    /// Build the tokio channel for this device (not yet opened)
    pub fn open_async_transport(&self) -> Box<dyn AsyncTransport> {
        match &self.transport {
            TransportConfig::Tcp { host, port } => {
                Box::new(AsyncTcpTransport::new(host.clone(), *port))
            }
            TransportConfig::Serial { path, .. } => {
                Box::new(AsyncSerialTransport::new(path.clone(), self.serial_settings()))
            }
            TransportConfig::HidRaw { path } => Box::new(AsyncHidRawTransport::new(path.clone())),
        }
    }

    /// Blocking session over this device's channel
    pub fn session(&self) -> Session<Box<dyn Transport>, Box<dyn FramingStrategy>> {
        Session::new(self.open_transport(), self.framing(), self.session_config())
    }

    /// Async session over this device's channel
    pub fn async_session(&self) -> AsyncSession<Box<dyn AsyncTransport>, Box<dyn FramingStrategy>> {
        AsyncSession::new(
            self.open_async_transport(),
            self.framing(),
            self.session_config(),
        )
    }
}
