//! Device Protocol Communication
//!
//! Implements the BMS register protocol (length-prefixed binary frames with an
//! additive checksum) and the inverter ASCII protocol (terminator-delimited frames
//! with a CRC-16/CCITT checksum) over TCP, serial and raw HID transports.

pub mod commands;
pub mod crc;
pub mod engine;
mod error;
pub mod frame;
pub mod transport;

pub use commands::{BmsRegister, Command, CommandCode, Family, InverterQuery};
pub use crc::{CcittChecksum, Checksum, SumChecksum};
pub use engine::{
    AsyncSession, Exchange, PollState, RetryPolicy, Session, SessionConfig, SessionCounters, Validator,
};
pub use error::{FrameError, SessionDisposed, SessionError, TransportError};
pub use frame::{BmsFraming, Frame, FramingStrategy, InverterFraming, ReceiveRule};
pub use transport::{AsyncTransport, Transport};

/// Default baud rate for BMS serial links
pub const BMS_BAUD_RATE: u32 = 9600;

/// Default baud rate for inverter serial links
pub const INVERTER_BAUD_RATE: u32 = 2400;

/// HID reports carry at most this many bytes per write
pub const HID_PAGE_SIZE: usize = 8;

/// Minimum spacing between two requests to one device
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

/// How long a caller waits for exclusive use of a session
pub const DEFAULT_ACQUIRE_TIMEOUT_MS: u64 = 5000;

/// Timeout of a single transport read
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 500;

/// Overall budget for receiving one reply
/// Inverters at 2400 baud need ~450ms for a full QPIGS reply.
pub const DEFAULT_RECEIVE_TIMEOUT_MS: u64 = 2000;

/// Budget for the wake exchange after a reopen
pub const DEFAULT_WAKE_TIMEOUT_MS: u64 = 500;

/// Default number of send attempts per request
pub const DEFAULT_RETRIES: u32 = 3;

/// TCP connect timeout
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 3000;

/// Maximum frame size
pub const MAX_FRAME_SIZE: usize = 8192;
