//! Protocol commands
//!
//! Defines the commands supported by the BMS register protocol and the
//! inverter ASCII query protocol.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::FrameError;

/// BMS requests carry a one-byte payload length
pub const BMS_MAX_PAYLOAD: usize = u8::MAX as usize;

/// Device family a command or frame belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    /// Battery-management system, binary register protocol
    Bms,
    /// Solar inverter, ASCII query protocol
    Inverter,
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::Bms => f.write_str("bms"),
            Family::Inverter => f.write_str("inverter"),
        }
    }
}

/// Identifier of a command, echoed back by the device in its reply
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandCode {
    /// BMS register number
    Register(u8),
    /// Inverter query text, e.g. `QPIGS`
    Ascii(String),
}

impl fmt::Display for CommandCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandCode::Register(reg) => write!(f, "{reg:#04x}"),
            CommandCode::Ascii(text) => f.write_str(text),
        }
    }
}

/// A request to send to a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    code: CommandCode,
    payload: Vec<u8>,
    expects_reply: bool,
}

impl Command {
    /// BMS register read (status byte `0xA5`, empty payload)
    pub fn read_register(register: u8) -> Self {
        Self {
            code: CommandCode::Register(register),
            payload: Vec::new(),
            expects_reply: true,
        }
    }

    /// BMS register write with the given payload.
    ///
    /// Fails with [`FrameError::PayloadTooLong`] above [`BMS_MAX_PAYLOAD`] bytes.
    pub fn write_register(register: u8, payload: Vec<u8>) -> Result<Self, FrameError> {
        if payload.len() > BMS_MAX_PAYLOAD {
            return Err(FrameError::PayloadTooLong {
                len: payload.len(),
                max: BMS_MAX_PAYLOAD,
            });
        }
        Ok(Self::register_write(register, payload))
    }

    /// Write whose payload is already known to fit the length byte
    pub(crate) fn register_write(register: u8, payload: Vec<u8>) -> Self {
        Self {
            code: CommandCode::Register(register),
            payload,
            expects_reply: true,
        }
    }

    /// Inverter ASCII query
    pub fn ascii(text: impl Into<String>) -> Self {
        Self {
            code: CommandCode::Ascii(text.into()),
            payload: Vec::new(),
            expects_reply: true,
        }
    }

    /// Send this command without waiting for a reply
    pub fn without_reply(mut self) -> Self {
        self.expects_reply = false;
        self
    }

    /// Command identifier
    pub fn code(&self) -> &CommandCode {
        &self.code
    }

    /// Encoded command payload; for ASCII commands this is the query text
    pub fn payload(&self) -> &[u8] {
        match &self.code {
            CommandCode::Ascii(text) => text.as_bytes(),
            CommandCode::Register(_) => &self.payload,
        }
    }

    /// Check if this command expects a response
    pub fn expects_reply(&self) -> bool {
        self.expects_reply
    }
}

/// Well-known BMS registers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum BmsRegister {
    /// Pack voltage, current, capacity, protection flags, temperatures
    BasicInfo = 0x03,
    /// Per-cell voltages
    CellVoltages = 0x04,
    /// Hardware/model string
    HardwareVersion = 0x05,
    /// Charge/discharge MOSFET control (write)
    MosControl = 0xE1,
}

impl BmsRegister {
    /// Register number on the wire
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Look up a register by number
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x03 => Some(Self::BasicInfo),
            0x04 => Some(Self::CellVoltages),
            0x05 => Some(Self::HardwareVersion),
            0xE1 => Some(Self::MosControl),
            _ => None,
        }
    }
}

impl From<BmsRegister> for Command {
    fn from(register: BmsRegister) -> Self {
        Command::read_register(register.code())
    }
}

/// Build a MOS control write.
///
/// `disable_charge`/`disable_discharge` map to bits 0 and 1 of the mask byte.
pub fn mos_control(disable_charge: bool, disable_discharge: bool) -> Command {
    let mask = (disable_charge as u8) | ((disable_discharge as u8) << 1);
    Command::register_write(BmsRegister::MosControl.code(), vec![0x00, mask])
}

/// Well-known inverter queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InverterQuery {
    /// `QPI` protocol id
    ProtocolId,
    /// `QID` serial number
    SerialNumber,
    /// `QVFW` main CPU firmware version
    FirmwareVersion,
    /// `QPIGS` general status parameters
    GeneralStatus,
    /// `QMOD` device mode
    DeviceMode,
    /// `QPIWS` warning status
    WarningStatus,
}

impl InverterQuery {
    /// All queries with a built-in decoder
    pub const ALL: [InverterQuery; 6] = [
        InverterQuery::ProtocolId,
        InverterQuery::SerialNumber,
        InverterQuery::FirmwareVersion,
        InverterQuery::GeneralStatus,
        InverterQuery::DeviceMode,
        InverterQuery::WarningStatus,
    ];

    /// Query text sent on the wire
    pub fn as_str(self) -> &'static str {
        match self {
            InverterQuery::ProtocolId => "QPI",
            InverterQuery::SerialNumber => "QID",
            InverterQuery::FirmwareVersion => "QVFW",
            InverterQuery::GeneralStatus => "QPIGS",
            InverterQuery::DeviceMode => "QMOD",
            InverterQuery::WarningStatus => "QPIWS",
        }
    }

    /// Identifier used for response lookup
    pub fn code(self) -> CommandCode {
        CommandCode::Ascii(self.as_str().to_string())
    }
}

impl From<InverterQuery> for Command {
    fn from(query: InverterQuery) -> Self {
        Command::ascii(query.as_str())
    }
}
