//! BMS register reply decoders

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::fields::{bit, Fields};
use super::{DecodeError, Response};

/// Fixed part of the basic-info reply, up to and including the NTC count
const BASIC_INFO_FIXED_LEN: usize = 23;
/// NTC readings are deci-Kelvin; 2731 is 0 °C
const KELVIN_OFFSET_DECI: i32 = 2731;

/// Protection status bitfield (register 0x03, bytes 16–17)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProtectionFlags(pub u16);

/// Named protection conditions, by bit position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protection {
    CellOvervoltage,
    CellUndervoltage,
    PackOvervoltage,
    PackUndervoltage,
    ChargeOvertemperature,
    ChargeUndertemperature,
    DischargeOvertemperature,
    DischargeUndertemperature,
    ChargeOvercurrent,
    DischargeOvercurrent,
    ShortCircuit,
    FrontEndIcError,
    SoftwareMosLock,
}

impl Protection {
    const ALL: [Protection; 13] = [
        Protection::CellOvervoltage,
        Protection::CellUndervoltage,
        Protection::PackOvervoltage,
        Protection::PackUndervoltage,
        Protection::ChargeOvertemperature,
        Protection::ChargeUndertemperature,
        Protection::DischargeOvertemperature,
        Protection::DischargeUndertemperature,
        Protection::ChargeOvercurrent,
        Protection::DischargeOvercurrent,
        Protection::ShortCircuit,
        Protection::FrontEndIcError,
        Protection::SoftwareMosLock,
    ];
}

impl ProtectionFlags {
    /// Whether `protection` is raised
    pub fn is_set(&self, protection: Protection) -> bool {
        bit(self.0 as u32, protection as u32)
    }

    /// Conditions currently raised
    pub fn active(&self) -> Vec<Protection> {
        Protection::ALL
            .into_iter()
            .filter(|p| self.is_set(*p))
            .collect()
    }

    /// Whether any protection is raised
    pub fn any(&self) -> bool {
        self.0 != 0
    }
}

/// Register 0x03: pack-level telemetry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicInfo {
    /// Pack voltage (V)
    pub total_voltage: f32,
    /// Pack current (A); negative while discharging
    pub current: f32,
    /// Remaining capacity (mAh)
    pub residual_capacity_mah: u32,
    /// Design capacity (mAh)
    pub nominal_capacity_mah: u32,
    /// Completed charge cycles
    pub cycle_count: u16,
    /// `None` when the packed date is not a real day
    pub production_date: Option<NaiveDate>,
    /// Balancing state of cells 1–32, bit 0 = cell 1
    pub balance_bitmap: u32,
    /// Raised protection conditions
    pub protection: ProtectionFlags,
    /// Firmware revision byte
    pub software_version: u8,
    /// State of charge (%)
    pub state_of_charge: u8,
    /// Charge MOSFET conducting
    pub charge_fet_on: bool,
    /// Discharge MOSFET conducting
    pub discharge_fet_on: bool,
    /// Series cell count
    pub cell_count: u8,
    /// NTC temperatures (°C)
    pub temperatures: Vec<f32>,
}

impl BasicInfo {
    /// Whether zero-based `cell` is balancing
    pub fn is_balancing(&self, cell: usize) -> bool {
        cell < 32 && bit(self.balance_bitmap, cell as u32)
    }
}

/// Production date packed as `(year - 2000) << 9 | month << 5 | day`
fn packed_date(word: u16) -> Option<NaiveDate> {
    let year = 2000 + (word >> 9) as i32;
    let month = ((word >> 5) & 0x0F) as u32;
    let day = (word & 0x1F) as u32;
    NaiveDate::from_ymd_opt(year, month, day)
}

pub(crate) fn decode_basic_info(payload: &[u8]) -> Result<Response, DecodeError> {
    let f = Fields::new(payload);
    f.require(BASIC_INFO_FIXED_LEN)?;

    let ntc_count = f.u8(22)? as usize;
    f.require(BASIC_INFO_FIXED_LEN + ntc_count * 2)?;
    let temperatures = (0..ntc_count)
        .map(|i| {
            let raw = f.u16_be(BASIC_INFO_FIXED_LEN + i * 2)? as i32;
            Ok((raw - KELVIN_OFFSET_DECI) as f32 / 10.0)
        })
        .collect::<Result<Vec<_>, DecodeError>>()?;

    let balance_low = f.u16_be(12)? as u32;
    let balance_high = f.u16_be(14)? as u32;
    let fet = f.u8(20)?;

    Ok(Response::BasicInfo(BasicInfo {
        total_voltage: f.u16_be(0)? as f32 / 100.0,
        current: f.i16_be(2)? as f32 / 100.0,
        residual_capacity_mah: f.u16_be(4)? as u32 * 10,
        nominal_capacity_mah: f.u16_be(6)? as u32 * 10,
        cycle_count: f.u16_be(8)?,
        production_date: packed_date(f.u16_be(10)?),
        balance_bitmap: balance_high << 16 | balance_low,
        protection: ProtectionFlags(f.u16_be(16)?),
        software_version: f.u8(18)?,
        state_of_charge: f.u8(19)?,
        charge_fet_on: bit(fet as u32, 0),
        discharge_fet_on: bit(fet as u32, 1),
        cell_count: f.u8(21)?,
        temperatures,
    }))
}

/// Register 0x04: per-cell voltages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellVoltages {
    /// Cell voltages (mV), cell 1 first
    pub millivolts: Vec<u16>,
}

impl CellVoltages {
    /// Cell voltages in volts
    pub fn volts(&self) -> Vec<f32> {
        self.millivolts.iter().map(|&mv| mv as f32 / 1000.0).collect()
    }

    /// Highest minus lowest cell (mV)
    pub fn spread_mv(&self) -> u16 {
        let max = self.millivolts.iter().max().copied().unwrap_or(0);
        let min = self.millivolts.iter().min().copied().unwrap_or(0);
        max - min
    }
}

pub(crate) fn decode_cell_voltages(payload: &[u8]) -> Result<Response, DecodeError> {
    if payload.len() % 2 != 0 {
        return Err(DecodeError::InvalidField {
            field: "cell_voltages",
            reason: format!("odd payload length {}", payload.len()),
        });
    }
    let f = Fields::new(payload);
    let millivolts = (0..payload.len() / 2)
        .map(|i| f.u16_be(i * 2))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Response::CellVoltages(CellVoltages { millivolts }))
}

pub(crate) fn decode_hardware_version(payload: &[u8]) -> Result<Response, DecodeError> {
    let version = Fields::new(payload).ascii(0, payload.len())?;
    Ok(Response::HardwareVersion(version))
}

pub(crate) fn decode_write_ack(payload: &[u8]) -> Result<Response, DecodeError> {
    if !payload.is_empty() {
        return Err(DecodeError::InvalidField {
            field: "write_ack",
            reason: format!("expected empty payload, got {} bytes", payload.len()),
        });
    }
    Ok(Response::Ack)
}
