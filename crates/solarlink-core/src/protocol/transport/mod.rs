//! Transport channels
//!
//! One capability set over three physical links: a TCP stream, a serial port
//! and a raw HID device file. Blocking variants implement [`Transport`];
//! tokio variants implement [`AsyncTransport`].
//!
//! Shared semantics:
//! - `open` on an open channel is a no-op
//! - `close` on a closed channel is a no-op
//! - after `dispose`, every operation fails with [`TransportError::Disposed`]
//! - `read` blocks up to the given timeout, returns `Ok(0)` on graceful remote
//!   close and `Err(TransportError::TimedOut)` when nothing arrived in time

mod asynchronous;
mod hidraw;
mod serial;
mod tcp;

use std::fmt;
use std::time::Duration;

pub use asynchronous::{AsyncHidRawTransport, AsyncSerialTransport, AsyncTcpTransport, AsyncTransport};
pub use hidraw::HidRawTransport;
pub use serial::{SerialSettings, SerialTransport};
pub use tcp::TcpTransport;

use super::TransportError;

/// Blocking transport channel
pub trait Transport: Send {
    /// Open the channel; no-op when already open
    fn open(&mut self) -> Result<(), TransportError>;

    /// Close the channel; no-op when not open
    fn close(&mut self) -> Result<(), TransportError>;

    /// Read available bytes, waiting at most `timeout`
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Write all of `bytes`
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Push buffered output to the device
    fn flush(&mut self) -> Result<(), TransportError>;

    /// Drop stale bytes waiting in the input buffer
    fn discard_input(&mut self) -> Result<(), TransportError>;

    /// Close for good; later calls fail with [`TransportError::Disposed`]
    fn dispose(&mut self);

    /// Whether the channel is currently open
    fn is_open(&self) -> bool;

    /// Largest write the link accepts at once, if limited
    fn page_size(&self) -> Option<usize> {
        None
    }

    /// Endpoint description for logs
    fn endpoint(&self) -> String;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn open(&mut self) -> Result<(), TransportError> {
        (**self).open()
    }
    fn close(&mut self) -> Result<(), TransportError> {
        (**self).close()
    }
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        (**self).read(buf, timeout)
    }
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        (**self).write(bytes)
    }
    fn flush(&mut self) -> Result<(), TransportError> {
        (**self).flush()
    }
    fn discard_input(&mut self) -> Result<(), TransportError> {
        (**self).discard_input()
    }
    fn dispose(&mut self) {
        (**self).dispose()
    }
    fn is_open(&self) -> bool {
        (**self).is_open()
    }
    fn page_size(&self) -> Option<usize> {
        (**self).page_size()
    }
    fn endpoint(&self) -> String {
        (**self).endpoint()
    }
}

/// Open/closed/disposed bookkeeping shared by all channel variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum ChannelState {
    #[default]
    Closed,
    Open,
    Disposed,
}

impl ChannelState {
    pub(crate) fn check_usable(self) -> Result<(), TransportError> {
        match self {
            ChannelState::Disposed => Err(TransportError::Disposed),
            _ => Ok(()),
        }
    }

    pub(crate) fn check_open(self) -> Result<(), TransportError> {
        match self {
            ChannelState::Open => Ok(()),
            ChannelState::Closed => Err(TransportError::NotOpen),
            ChannelState::Disposed => Err(TransportError::Disposed),
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelState::Closed => f.write_str("closed"),
            ChannelState::Open => f.write_str("open"),
            ChannelState::Disposed => f.write_str("disposed"),
        }
    }
}

/// Map a read error to the channel's timeout/close semantics
pub(crate) fn map_read_error(e: std::io::Error) -> TransportError {
    match e.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => TransportError::TimedOut,
        std::io::ErrorKind::UnexpectedEof => TransportError::Closed,
        _ => TransportError::Io(e),
    }
}
