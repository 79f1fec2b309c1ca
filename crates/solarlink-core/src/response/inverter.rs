//! Inverter ASCII reply decoders

use serde::{Deserialize, Serialize};

use super::fields::{bit_string, parse_field, text_fields};
use super::{DecodeError, Response};

/// Fields before the device-status bit string in a `QPIGS` reply
const GENERAL_STATUS_FIELDS: usize = 17;

/// `QMOD` operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceMode {
    PowerOn,
    Standby,
    Line,
    Battery,
    Fault,
    /// `H`
    PowerSaving,
    /// Any other mode letter
    Unknown(char),
}

impl From<char> for DeviceMode {
    fn from(c: char) -> Self {
        match c {
            'P' => DeviceMode::PowerOn,
            'S' => DeviceMode::Standby,
            'L' => DeviceMode::Line,
            'B' => DeviceMode::Battery,
            'F' => DeviceMode::Fault,
            'H' => DeviceMode::PowerSaving,
            other => DeviceMode::Unknown(other),
        }
    }
}

/// Device status bits `b7..b0` at the end of a `QPIGS` reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceStatus {
    /// b7: SBU priority firmware
    pub sbu_priority_version: bool,
    /// b6
    pub configuration_changed: bool,
    /// b5
    pub scc_firmware_updated: bool,
    /// b4
    pub load_on: bool,
    /// b3
    pub battery_voltage_steady: bool,
    /// b2: charging from any source
    pub charging: bool,
    /// b1: solar charge controller charging
    pub scc_charging: bool,
    /// b0: utility charging
    pub ac_charging: bool,
}

impl DeviceStatus {
    fn from_bits(bits: &[bool]) -> Self {
        Self {
            sbu_priority_version: bits[0],
            configuration_changed: bits[1],
            scc_firmware_updated: bits[2],
            load_on: bits[3],
            battery_voltage_steady: bits[4],
            charging: bits[5],
            scc_charging: bits[6],
            ac_charging: bits[7],
        }
    }
}

/// `QPIGS` general status parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralStatus {
    /// V
    pub grid_voltage: f32,
    /// Hz
    pub grid_frequency: f32,
    /// V
    pub ac_output_voltage: f32,
    /// Hz
    pub ac_output_frequency: f32,
    /// VA
    pub ac_output_apparent_power: u32,
    /// W
    pub ac_output_active_power: u32,
    /// Percent of rated load
    pub output_load_percent: u16,
    /// DC bus (V)
    pub bus_voltage: u16,
    /// V
    pub battery_voltage: f32,
    /// A
    pub battery_charging_current: u16,
    /// Percent
    pub battery_capacity_percent: u16,
    /// °C
    pub heat_sink_temperature: i16,
    /// A
    pub pv_input_current: f32,
    /// V
    pub pv_input_voltage: f32,
    /// Battery voltage seen by the charge controller (V)
    pub battery_voltage_from_scc: f32,
    /// A
    pub battery_discharge_current: u32,
    /// Trailing status bits
    pub status: DeviceStatus,
}

impl GeneralStatus {
    /// PV input power (W) derived from current and voltage
    pub fn pv_input_power(&self) -> f32 {
        self.pv_input_current * self.pv_input_voltage
    }
}

/// `QPIWS` warning bits, first character first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarningStatus {
    /// One flag per warning, in reply order
    pub bits: Vec<bool>,
}

impl WarningStatus {
    /// Indices of the warnings that are raised
    pub fn active(&self) -> Vec<usize> {
        self.bits
            .iter()
            .enumerate()
            .filter_map(|(i, &set)| set.then_some(i))
            .collect()
    }

    /// Whether any warning is raised
    pub fn any(&self) -> bool {
        self.bits.iter().any(|&b| b)
    }
}

fn text(payload: &[u8]) -> Result<String, DecodeError> {
    let text = std::str::from_utf8(payload).map_err(|e| DecodeError::InvalidField {
        field: "payload",
        reason: e.to_string(),
    })?;
    Ok(text.trim().to_string())
}

pub(crate) fn decode_protocol_id(payload: &[u8]) -> Result<Response, DecodeError> {
    Ok(Response::ProtocolId(text(payload)?))
}

pub(crate) fn decode_serial_number(payload: &[u8]) -> Result<Response, DecodeError> {
    Ok(Response::SerialNumber(text(payload)?))
}

pub(crate) fn decode_firmware_version(payload: &[u8]) -> Result<Response, DecodeError> {
    let text = text(payload)?;
    let version = text.strip_prefix("VERFW:").unwrap_or(&text);
    Ok(Response::FirmwareVersion(version.to_string()))
}

pub(crate) fn decode_device_mode(payload: &[u8]) -> Result<Response, DecodeError> {
    let text = text(payload)?;
    let mut chars = text.chars();
    match (chars.next(), chars.next()) {
        (Some(mode), None) => Ok(Response::DeviceMode(DeviceMode::from(mode))),
        _ => Err(DecodeError::InvalidField {
            field: "mode",
            reason: format!("expected one character, got {text:?}"),
        }),
    }
}

pub(crate) fn decode_general_status(payload: &[u8]) -> Result<Response, DecodeError> {
    let f = text_fields(payload)?;
    if f.len() < GENERAL_STATUS_FIELDS {
        return Err(DecodeError::Truncated {
            needed: GENERAL_STATUS_FIELDS,
            actual: f.len(),
        });
    }
    let bits = bit_string("device_status", f[16])?;
    if bits.len() != 8 {
        return Err(DecodeError::InvalidField {
            field: "device_status",
            reason: format!("expected 8 flags, got {}", bits.len()),
        });
    }

    Ok(Response::GeneralStatus(GeneralStatus {
        grid_voltage: parse_field("grid_voltage", f[0])?,
        grid_frequency: parse_field("grid_frequency", f[1])?,
        ac_output_voltage: parse_field("ac_output_voltage", f[2])?,
        ac_output_frequency: parse_field("ac_output_frequency", f[3])?,
        ac_output_apparent_power: parse_field("ac_output_apparent_power", f[4])?,
        ac_output_active_power: parse_field("ac_output_active_power", f[5])?,
        output_load_percent: parse_field("output_load_percent", f[6])?,
        bus_voltage: parse_field("bus_voltage", f[7])?,
        battery_voltage: parse_field("battery_voltage", f[8])?,
        battery_charging_current: parse_field("battery_charging_current", f[9])?,
        battery_capacity_percent: parse_field("battery_capacity_percent", f[10])?,
        heat_sink_temperature: parse_field("heat_sink_temperature", f[11])?,
        pv_input_current: parse_field("pv_input_current", f[12])?,
        pv_input_voltage: parse_field("pv_input_voltage", f[13])?,
        battery_voltage_from_scc: parse_field("battery_voltage_from_scc", f[14])?,
        battery_discharge_current: parse_field("battery_discharge_current", f[15])?,
        status: DeviceStatus::from_bits(&bits),
    }))
}

pub(crate) fn decode_warning_status(payload: &[u8]) -> Result<Response, DecodeError> {
    let text = text(payload)?;
    if text.is_empty() {
        return Err(DecodeError::Truncated {
            needed: 1,
            actual: 0,
        });
    }
    Ok(Response::WarningStatus(WarningStatus {
        bits: bit_string("warnings", &text)?,
    }))
}
