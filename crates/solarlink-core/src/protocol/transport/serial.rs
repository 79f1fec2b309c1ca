//! Serial port handling

use std::io::{Read, Write};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serialport::SerialPort;
use tracing::{debug, warn};

use super::{map_read_error, ChannelState, Transport};
use crate::protocol::{Family, TransportError, BMS_BAUD_RATE, INVERTER_BAUD_RATE};

/// Line settings; every supported device runs 8N1 without flow control
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialSettings {
    /// Baud rate
    pub baud_rate: u32,
}

impl SerialSettings {
    /// Factory line settings for a device family
    pub fn for_family(family: Family) -> Self {
        let baud_rate = match family {
            Family::Bms => BMS_BAUD_RATE,
            Family::Inverter => INVERTER_BAUD_RATE,
        };
        Self { baud_rate }
    }
}

/// Open a serial port with the given line settings
fn open_port(path: &str, settings: SerialSettings) -> Result<Box<dyn SerialPort>, TransportError> {
    let mut port = serialport::new(path, settings.baud_rate)
        .timeout(Duration::from_millis(100))
        .open()?;
    configure_port(port.as_mut())?;
    Ok(port)
}

/// Configure a serial port for 8N1 without flow control
fn configure_port(port: &mut dyn SerialPort) -> Result<(), TransportError> {
    port.set_data_bits(serialport::DataBits::Eight)?;
    port.set_parity(serialport::Parity::None)?;
    port.set_stop_bits(serialport::StopBits::One)?;
    port.set_flow_control(serialport::FlowControl::None)?;

    // Some USB-RS485 adapters need DTR asserted to power their transceiver
    if let Err(e) = port.write_data_terminal_ready(true) {
        warn!("failed to set DTR high: {e} (continuing)");
    }

    Ok(())
}

/// Serial port channel
pub struct SerialTransport {
    path: String,
    settings: SerialSettings,
    port: Option<Box<dyn SerialPort>>,
    state: ChannelState,
}

impl SerialTransport {
    /// Unopened port at `path`
    pub fn new(path: impl Into<String>, settings: SerialSettings) -> Self {
        Self {
            path: path.into(),
            settings,
            port: None,
            state: ChannelState::Closed,
        }
    }

    /// Line settings used on open
    pub fn settings(&self) -> SerialSettings {
        self.settings
    }

    fn port(&mut self) -> Result<&mut Box<dyn SerialPort>, TransportError> {
        self.state.check_open()?;
        self.port.as_mut().ok_or(TransportError::NotOpen)
    }
}

impl Transport for SerialTransport {
    fn open(&mut self) -> Result<(), TransportError> {
        self.state.check_usable()?;
        if self.state == ChannelState::Open {
            return Ok(());
        }
        let port = open_port(&self.path, self.settings)?;
        debug!(path = %self.path, baud = self.settings.baud_rate, "serial channel open");
        self.port = Some(port);
        self.state = ChannelState::Open;
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.state.check_usable()?;
        if self.port.take().is_some() {
            debug!(path = %self.path, "serial channel closed");
        }
        self.state = ChannelState::Closed;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        let port = self.port()?;
        port.set_timeout(timeout)?;
        port.read(buf).map_err(map_read_error)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.port()?.write_all(bytes)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        self.port()?.flush()?;
        Ok(())
    }

    fn discard_input(&mut self) -> Result<(), TransportError> {
        self.port()?.clear(serialport::ClearBuffer::Input)?;
        Ok(())
    }

    fn dispose(&mut self) {
        self.port = None;
        self.state = ChannelState::Disposed;
    }

    fn is_open(&self) -> bool {
        self.state == ChannelState::Open
    }

    fn endpoint(&self) -> String {
        format!("serial://{}@{}", self.path, self.settings.baud_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_baud_rates() {
        assert_eq!(SerialSettings::for_family(Family::Bms).baud_rate, 9600);
        assert_eq!(SerialSettings::for_family(Family::Inverter).baud_rate, 2400);
    }

    #[test]
    fn test_missing_port_fails_to_open() {
        let mut transport = SerialTransport::new(
            "/dev/solarlink-does-not-exist",
            SerialSettings::for_family(Family::Bms),
        );
        assert!(transport.open().is_err());
        assert!(!transport.is_open());
    }

    #[test]
    fn test_dispose_blocks_further_use() {
        let mut transport =
            SerialTransport::new("/dev/null", SerialSettings::for_family(Family::Inverter));
        transport.dispose();
        assert!(matches!(transport.open(), Err(TransportError::Disposed)));
        assert!(matches!(transport.close(), Err(TransportError::Disposed)));
        assert_eq!(transport.endpoint(), "serial:///dev/null@2400");
    }
}
