//! Device sessions
//!
//! Thin per-family wrappers over a [`Session`]/[`AsyncSession`] with typed
//! getters. Every getter returns `Ok(None)` when the device could not be
//! read; only a disposed session is an error.

use crate::protocol::commands::{mos_control, BmsRegister, Command, InverterQuery};
use crate::protocol::{
    AsyncSession, AsyncTransport, BmsFraming, InverterFraming, Session, SessionConfig,
    SessionCounters, SessionDisposed, Transport,
};
use crate::response::{
    BasicInfo, CellVoltages, DeviceMode, GeneralStatus, Response, WarningStatus,
};

/// Pull a typed value out of an accepted exchange
macro_rules! pick {
    ($exchange:expr, $variant:path) => {
        match $exchange.response {
            Some($variant(value)) => Some(value),
            _ => None,
        }
    };
}

/// Battery-management system over a blocking transport
pub struct BmsDevice<T> {
    session: Session<T, BmsFraming>,
}

impl<T: Transport> BmsDevice<T> {
    /// Wrap `transport` in a fresh BMS session
    pub fn new(transport: T, config: SessionConfig) -> Self {
        Self {
            session: Session::new(transport, BmsFraming, config),
        }
    }

    /// Reuse an existing BMS session
    pub fn from_session(session: Session<T, BmsFraming>) -> Self {
        Self { session }
    }

    /// Underlying session, for raw requests
    pub fn session(&self) -> &Session<T, BmsFraming> {
        &self.session
    }

    /// Register 0x03: pack voltage, current, capacity and FET state
    pub fn basic_info(&self) -> Result<Option<BasicInfo>, SessionDisposed> {
        let exchange = self.session.request(&BmsRegister::BasicInfo.into())?;
        Ok(pick!(exchange, Response::BasicInfo))
    }

    /// Register 0x04
    pub fn cell_voltages(&self) -> Result<Option<CellVoltages>, SessionDisposed> {
        let exchange = self.session.request(&BmsRegister::CellVoltages.into())?;
        Ok(pick!(exchange, Response::CellVoltages))
    }

    /// Register 0x05 as text
    pub fn hardware_version(&self) -> Result<Option<String>, SessionDisposed> {
        let exchange = self.session.request(&BmsRegister::HardwareVersion.into())?;
        Ok(pick!(exchange, Response::HardwareVersion))
    }

    /// Switch the charge/discharge MOSFETs; true once the BMS acknowledged
    pub fn set_mos(
        &self,
        disable_charge: bool,
        disable_discharge: bool,
    ) -> Result<bool, SessionDisposed> {
        let exchange = self
            .session
            .request(&mos_control(disable_charge, disable_discharge))?;
        Ok(matches!(exchange.response, Some(Response::Ack)))
    }

    /// Snapshot of the session counters
    pub fn counters(&self) -> SessionCounters {
        self.session.counters()
    }

    /// Close the transport for good; later calls fail with [`SessionDisposed`]
    pub fn dispose(&self) {
        self.session.dispose()
    }
}

/// Solar inverter over a blocking transport
pub struct InverterDevice<T> {
    session: Session<T, InverterFraming>,
}

impl<T: Transport> InverterDevice<T> {
    /// `hid` prefixes requests with the HID report id
    pub fn new(transport: T, hid: bool, config: SessionConfig) -> Self {
        Self {
            session: Session::new(transport, InverterFraming::new(hid), config),
        }
    }

    /// Reuse an existing inverter session
    pub fn from_session(session: Session<T, InverterFraming>) -> Self {
        Self { session }
    }

    /// Underlying session, for raw requests
    pub fn session(&self) -> &Session<T, InverterFraming> {
        &self.session
    }

    fn query(&self, query: InverterQuery) -> Result<crate::protocol::Exchange, SessionDisposed> {
        self.session.request(&Command::from(query))
    }

    /// `QPI`, e.g. `PI30`
    pub fn protocol_id(&self) -> Result<Option<String>, SessionDisposed> {
        Ok(pick!(self.query(InverterQuery::ProtocolId)?, Response::ProtocolId))
    }

    /// `QID`
    pub fn serial_number(&self) -> Result<Option<String>, SessionDisposed> {
        Ok(pick!(self.query(InverterQuery::SerialNumber)?, Response::SerialNumber))
    }

    /// `QVFW` with the `VERFW:` prefix stripped
    pub fn firmware_version(&self) -> Result<Option<String>, SessionDisposed> {
        Ok(pick!(self.query(InverterQuery::FirmwareVersion)?, Response::FirmwareVersion))
    }

    /// `QPIGS` live readings
    pub fn general_status(&self) -> Result<Option<GeneralStatus>, SessionDisposed> {
        Ok(pick!(self.query(InverterQuery::GeneralStatus)?, Response::GeneralStatus))
    }

    /// `QMOD`
    pub fn device_mode(&self) -> Result<Option<DeviceMode>, SessionDisposed> {
        Ok(pick!(self.query(InverterQuery::DeviceMode)?, Response::DeviceMode))
    }

    /// `QPIWS` warning bits
    pub fn warning_status(&self) -> Result<Option<WarningStatus>, SessionDisposed> {
        Ok(pick!(self.query(InverterQuery::WarningStatus)?, Response::WarningStatus))
    }

    /// Snapshot of the session counters
    pub fn counters(&self) -> SessionCounters {
        self.session.counters()
    }

    /// Close the transport for good; later calls fail with [`SessionDisposed`]
    pub fn dispose(&self) {
        self.session.dispose()
    }
}

/// Battery-management system over a tokio transport
pub struct AsyncBmsDevice<T> {
    session: AsyncSession<T, BmsFraming>,
}

impl<T: AsyncTransport> AsyncBmsDevice<T> {
    /// Wrap `transport` in a fresh async BMS session
    pub fn new(transport: T, config: SessionConfig) -> Self {
        Self {
            session: AsyncSession::new(transport, BmsFraming, config),
        }
    }

    /// Underlying session, for raw requests and counters
    pub fn session(&self) -> &AsyncSession<T, BmsFraming> {
        &self.session
    }

    /// Register 0x03
    pub async fn basic_info(&self) -> Result<Option<BasicInfo>, SessionDisposed> {
        let exchange = self.session.request(&BmsRegister::BasicInfo.into()).await?;
        Ok(pick!(exchange, Response::BasicInfo))
    }

    /// Register 0x04
    pub async fn cell_voltages(&self) -> Result<Option<CellVoltages>, SessionDisposed> {
        let exchange = self
            .session
            .request(&BmsRegister::CellVoltages.into())
            .await?;
        Ok(pick!(exchange, Response::CellVoltages))
    }

    /// Register 0x05 as text
    pub async fn hardware_version(&self) -> Result<Option<String>, SessionDisposed> {
        let exchange = self
            .session
            .request(&BmsRegister::HardwareVersion.into())
            .await?;
        Ok(pick!(exchange, Response::HardwareVersion))
    }

    /// Switch the charge/discharge MOSFETs; true once the BMS acknowledged
    pub async fn set_mos(
        &self,
        disable_charge: bool,
        disable_discharge: bool,
    ) -> Result<bool, SessionDisposed> {
        let exchange = self
            .session
            .request(&mos_control(disable_charge, disable_discharge))
            .await?;
        Ok(matches!(exchange.response, Some(Response::Ack)))
    }

    /// Close the transport for good; later calls fail with [`SessionDisposed`]
    pub async fn dispose(&self) {
        self.session.dispose().await
    }
}

/// Solar inverter over a tokio transport
pub struct AsyncInverterDevice<T> {
    session: AsyncSession<T, InverterFraming>,
}

impl<T: AsyncTransport> AsyncInverterDevice<T> {
    /// `hid` prefixes requests with the HID report id
    pub fn new(transport: T, hid: bool, config: SessionConfig) -> Self {
        Self {
            session: AsyncSession::new(transport, InverterFraming::new(hid), config),
        }
    }

    /// Underlying session, for raw requests and counters
    pub fn session(&self) -> &AsyncSession<T, InverterFraming> {
        &self.session
    }

    async fn query(
        &self,
        query: InverterQuery,
    ) -> Result<crate::protocol::Exchange, SessionDisposed> {
        self.session.request(&Command::from(query)).await
    }

    /// `QPI`
    pub async fn protocol_id(&self) -> Result<Option<String>, SessionDisposed> {
        Ok(pick!(self.query(InverterQuery::ProtocolId).await?, Response::ProtocolId))
    }

    /// `QID`
    pub async fn serial_number(&self) -> Result<Option<String>, SessionDisposed> {
        Ok(pick!(self.query(InverterQuery::SerialNumber).await?, Response::SerialNumber))
    }

    /// `QVFW` with the `VERFW:` prefix stripped
    pub async fn firmware_version(&self) -> Result<Option<String>, SessionDisposed> {
        Ok(pick!(
            self.query(InverterQuery::FirmwareVersion).await?,
            Response::FirmwareVersion
        ))
    }

    /// `QPIGS` live readings
    pub async fn general_status(&self) -> Result<Option<GeneralStatus>, SessionDisposed> {
        Ok(pick!(
            self.query(InverterQuery::GeneralStatus).await?,
            Response::GeneralStatus
        ))
    }

    /// `QMOD`
    pub async fn device_mode(&self) -> Result<Option<DeviceMode>, SessionDisposed> {
        Ok(pick!(self.query(InverterQuery::DeviceMode).await?, Response::DeviceMode))
    }

    /// `QPIWS` warning bits
    pub async fn warning_status(&self) -> Result<Option<WarningStatus>, SessionDisposed> {
        Ok(pick!(
            self.query(InverterQuery::WarningStatus).await?,
            Response::WarningStatus
        ))
    }

    /// Close the transport for good; later calls fail with [`SessionDisposed`]
    pub async fn dispose(&self) {
        self.session.dispose().await
    }
}
