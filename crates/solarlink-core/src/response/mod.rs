//! Response decoding
//!
//! Maps the command code of a CRC-checked [`Frame`] to a payload decoder and
//! returns a tagged [`Response`]. Dispatch happens here, keyed by
//! `(Family, CommandCode)`, so callers match on the variant they asked for.

pub mod bms;
pub mod fields;
pub mod inverter;

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::protocol::commands::{BmsRegister, CommandCode, Family, InverterQuery};
use crate::protocol::frame::Frame;

pub use bms::{BasicInfo, CellVoltages, Protection, ProtectionFlags};
pub use inverter::{DeviceMode, DeviceStatus, GeneralStatus, WarningStatus};

/// Payload body of an inverter negative acknowledgement
const NAK: &[u8] = b"NAK";

/// Errors raised while extracting typed fields from a payload
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Payload shorter than the field layout needs
    #[error("Payload truncated: need {needed} bytes, got {actual}")]
    Truncated { needed: usize, actual: usize },

    /// A field is present but unparseable
    #[error("Invalid field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },

    /// Inverter refused the query
    #[error("Device answered NAK")]
    Nak,

    /// No decoder for this command code
    #[error("No decoder registered for {0}")]
    Unrecognized(CommandCode),
}

/// A decoded reply, tagged by the command that produced it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Response {
    /// BMS register 0x03
    BasicInfo(BasicInfo),
    /// BMS register 0x04
    CellVoltages(CellVoltages),
    /// BMS register 0x05
    HardwareVersion(String),
    /// Empty acknowledgement of a register write
    Ack,
    /// `QPI`
    ProtocolId(String),
    /// `QID`
    SerialNumber(String),
    /// `QVFW`, prefix stripped
    FirmwareVersion(String),
    /// `QPIGS`
    GeneralStatus(GeneralStatus),
    /// `QMOD`
    DeviceMode(DeviceMode),
    /// `QPIWS`
    WarningStatus(WarningStatus),
    /// Structurally valid reply with no registered decoder
    Unrecognized { code: CommandCode, payload: Vec<u8> },
}

/// Payload decoder for one command code
pub type Decoder = fn(&[u8]) -> Result<Response, DecodeError>;

/// A second decoder was registered for a code that already has one
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Decoder already registered for {family} {code}")]
pub struct DuplicateDecoder {
    /// Family of the colliding entry
    pub family: Family,
    /// Command code of the colliding entry
    pub code: CommandCode,
}

/// `(family, code) -> decoder` table; at most one decoder per key
#[derive(Clone, Default)]
pub struct ResponseRegistry {
    decoders: HashMap<(Family, CommandCode), Decoder>,
}

impl fmt::Debug for ResponseRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.decoders.keys()).finish()
    }
}

impl ResponseRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the decoders of every built-in command
    pub fn with_defaults() -> Self {
        let mut decoders: HashMap<(Family, CommandCode), Decoder> = HashMap::new();

        let bms: [(BmsRegister, Decoder); 4] = [
            (BmsRegister::BasicInfo, bms::decode_basic_info),
            (BmsRegister::CellVoltages, bms::decode_cell_voltages),
            (BmsRegister::HardwareVersion, bms::decode_hardware_version),
            (BmsRegister::MosControl, bms::decode_write_ack),
        ];
        for (register, decoder) in bms {
            decoders.insert((Family::Bms, CommandCode::Register(register.code())), decoder);
        }

        for query in InverterQuery::ALL {
            let decoder: Decoder = match query {
                InverterQuery::ProtocolId => inverter::decode_protocol_id,
                InverterQuery::SerialNumber => inverter::decode_serial_number,
                InverterQuery::FirmwareVersion => inverter::decode_firmware_version,
                InverterQuery::GeneralStatus => inverter::decode_general_status,
                InverterQuery::DeviceMode => inverter::decode_device_mode,
                InverterQuery::WarningStatus => inverter::decode_warning_status,
            };
            decoders.insert((Family::Inverter, query.code()), decoder);
        }

        Self { decoders }
    }

    /// Add a decoder; fails if `code` already has one
    pub fn register(
        &mut self,
        family: Family,
        code: CommandCode,
        decoder: Decoder,
    ) -> Result<(), DuplicateDecoder> {
        let key = (family, code);
        if self.decoders.contains_key(&key) {
            let (family, code) = key;
            return Err(DuplicateDecoder { family, code });
        }
        self.decoders.insert(key, decoder);
        Ok(())
    }

    /// Decoder for `(family, code)`, if registered
    pub fn get(&self, family: Family, code: &CommandCode) -> Option<Decoder> {
        self.decoders.get(&(family, code.clone())).copied()
    }

    /// Whether `(family, code)` has a decoder
    pub fn contains(&self, family: Family, code: &CommandCode) -> bool {
        self.get(family, code).is_some()
    }

    /// Number of registered decoders
    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    /// True when nothing is registered
    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }
}

/// Turns validated frames into [`Response`]s
#[derive(Debug, Clone)]
pub struct ResponseFactory {
    registry: ResponseRegistry,
}

impl Default for ResponseFactory {
    fn default() -> Self {
        Self::new(ResponseRegistry::with_defaults())
    }
}

impl ResponseFactory {
    /// Decode with `registry`
    pub fn new(registry: ResponseRegistry) -> Self {
        Self { registry }
    }

    /// Decoder table in use
    pub fn registry(&self) -> &ResponseRegistry {
        &self.registry
    }

    /// Decode a frame's payload.
    ///
    /// With `allow_unrecognized`, a code without a decoder becomes
    /// [`Response::Unrecognized`] for the caller's validator to judge;
    /// otherwise it is [`DecodeError::Unrecognized`].
    pub fn decode(&self, frame: &Frame, allow_unrecognized: bool) -> Result<Response, DecodeError> {
        if frame.family == Family::Inverter && frame.payload == NAK {
            return Err(DecodeError::Nak);
        }

        match self.registry.get(frame.family, &frame.code) {
            Some(decoder) => decoder(&frame.payload),
            None if allow_unrecognized => {
                debug!(code = %frame.code, bytes = frame.payload.len(), "Passing unrecognized response to validator");
                Ok(Response::Unrecognized {
                    code: frame.code.clone(),
                    payload: frame.payload.clone(),
                })
            }
            None => Err(DecodeError::Unrecognized(frame.code.clone())),
        }
    }
}
