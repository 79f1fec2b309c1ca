//! Protocol errors

use std::time::Duration;

use thiserror::Error;

use super::commands::CommandCode;
use crate::response::DecodeError;

/// Errors raised by a transport channel
#[derive(Error, Debug)]
pub enum TransportError {
    /// Used after [`dispose`](super::Transport::dispose)
    #[error("Channel disposed")]
    Disposed,

    /// Read or write before `open`
    #[error("Channel not open")]
    NotOpen,

    /// Nothing arrived within the read timeout
    #[error("Read timed out")]
    TimedOut,

    /// Peer hung up
    #[error("Remote end closed the channel")]
    Closed,

    /// Error reported by the serial driver
    #[error("Serial port error: {0}")]
    Serial(String),

    /// Underlying OS error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serialport::Error> for TransportError {
    fn from(e: serialport::Error) -> Self {
        TransportError::Serial(e.to_string())
    }
}

/// Structural problems found while decoding a wire frame
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Fewer bytes than the smallest valid frame
    #[error("Frame too short: {len} bytes, need at least {min}")]
    TooShort { len: usize, min: usize },

    /// First byte is not the family start marker
    #[error("Marker mismatch: expected {expected:#04x}, got {actual:#04x}")]
    MarkerMismatch { expected: u8, actual: u8 },

    /// Reply echoes a different command than was sent
    #[error("Command mismatch: expected {expected}, got {actual}")]
    CommandMismatch {
        expected: CommandCode,
        actual: CommandCode,
    },

    /// Length field claims more payload than arrived
    #[error("Declared length {declared} overruns the {available} bytes received")]
    LengthOverrun { declared: usize, available: usize },

    /// Checksum over the payload does not match
    #[error("CRC mismatch: expected {expected:02x?}, got {actual:02x?}")]
    CrcMismatch { expected: [u8; 2], actual: [u8; 2] },

    /// Reply never reached its terminator byte
    #[error("No terminator {terminator:#04x} in {len} received bytes")]
    Unterminated { terminator: u8, len: usize },

    /// Write payload too long for the one-byte length field
    #[error("Payload of {len} bytes exceeds the {max}-byte length field")]
    PayloadTooLong { len: usize, max: usize },
}

/// Outcome of a failed request on a session
#[derive(Error, Debug)]
pub enum SessionError {
    /// Another request held the session for the whole acquire timeout
    #[error("Session busy: could not acquire it within {0:?}")]
    BusyTimeout(Duration),

    /// Channel failure on the last attempt
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Malformed reply on the last attempt
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    /// Reply framed correctly but its payload did not decode
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Valid reply to a command nobody registered a decoder for
    #[error("No decoder registered for response {0}")]
    UnrecognizedResponseType(CommandCode),

    /// The retry validator refused every reply
    #[error("Response rejected after {attempts} attempts")]
    Rejected { attempts: u32 },

    /// Cancellation token fired
    #[error("Operation cancelled")]
    Cancelled,

    /// Close/reopen/wake cycle failed
    #[error("Transport recovery failed: {0}")]
    RecoveryFailed(TransportError),

    /// Session was disposed before or during the request
    #[error("Session disposed")]
    Disposed,
}

impl SessionError {
    /// Whether another send/receive cycle may fix this failure
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SessionError::Transport(_)
                | SessionError::Frame(_)
                | SessionError::Decode(_)
                | SessionError::UnrecognizedResponseType(_)
                | SessionError::Rejected { .. }
        )
    }
}

/// The one fatal error at the boolean boundary: using a session after `dispose`
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Operation on a disposed session")]
pub struct SessionDisposed;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(SessionError::Frame(FrameError::TooShort { len: 3, min: 7 }).is_retryable());
        assert!(SessionError::Transport(TransportError::TimedOut).is_retryable());
        assert!(!SessionError::BusyTimeout(Duration::from_millis(5)).is_retryable());
        assert!(!SessionError::Cancelled.is_retryable());
        assert!(!SessionError::Disposed.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = FrameError::MarkerMismatch {
            expected: 0xDD,
            actual: 0x01,
        };
        assert_eq!(err.to_string(), "Marker mismatch: expected 0xdd, got 0x01");
    }
}
