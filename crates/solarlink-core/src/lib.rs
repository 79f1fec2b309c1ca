//! # SolarLink Core Library
//!
//! Protocol engine for battery-management systems and solar inverters.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Transport channels over TCP, serial ports and raw HID device files
//! - BMS register framing (additive checksum) and inverter ASCII framing (CRC-16/CCITT)
//! - A single-flight request/response engine with throttling, retries and recovery,
//!   in blocking and tokio flavours
//! - Typed decoders for BMS and inverter replies
//!
//! ## Supported devices
//!
//! - JBD-style BMS boards (register protocol, 9600 8N1 or TCP bridge)
//! - Voltronic-style inverters (ASCII query protocol, 2400 8N1 or USB HID)
//!
//! ## Example
//!
//! ```rust,ignore
//! use solarlink_core::{config::DeviceConfig, device::BmsDevice};
//!
//! let config = DeviceConfig::from_file("battery.json")?;
//! let bms = BmsDevice::new(config.open_transport(), config.session_config());
//!
//! if let Some(info) = bms.basic_info()? {
//!     println!("{:.2} V, {} %", info.total_voltage, info.state_of_charge);
//! }
//! ```

pub mod config;
pub mod device;
pub mod protocol;
pub mod response;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{ConfigError, DeviceConfig, TimingConfig, TransportConfig};
    pub use crate::device::{AsyncBmsDevice, AsyncInverterDevice, BmsDevice, InverterDevice};
    pub use crate::protocol::{
        AsyncSession, AsyncTransport, BmsRegister, Command, CommandCode, Exchange, Family,
        InverterQuery, RetryPolicy, Session, SessionConfig, SessionDisposed, SessionError,
        Transport,
    };
    pub use crate::response::{
        BasicInfo, CellVoltages, DeviceMode, GeneralStatus, Response, WarningStatus,
    };
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
