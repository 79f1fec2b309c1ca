//! Request/response engine
//!
//! One generic engine per session, parameterized by a transport and a
//! [`FramingStrategy`]. Every call walks the same states:
//!
//! `acquire -> throttle -> [recover] -> discard stale input -> send -> receive -> validate`
//!
//! ending in accept, retry (fresh send/receive) or abort. [`Session`] runs it on
//! blocking transports; [`AsyncSession`] runs it on tokio transports with the
//! same exclusivity and throttling guarantees.

mod blocking;
mod nonblocking;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

pub use blocking::Session;
pub use nonblocking::AsyncSession;

use super::commands::Command;
use super::frame::{FramingStrategy, ReceiveRule};
use super::{
    SessionError, DEFAULT_ACQUIRE_TIMEOUT_MS, DEFAULT_POLL_INTERVAL_MS, DEFAULT_READ_TIMEOUT_MS,
    DEFAULT_RECEIVE_TIMEOUT_MS, DEFAULT_RETRIES, DEFAULT_WAKE_TIMEOUT_MS, MAX_FRAME_SIZE,
};
use crate::response::{DecodeError, Response, ResponseFactory};

/// Size of the scratch buffer used for each transport read
pub(crate) const READ_CHUNK: usize = 256;

/// Engine timing for one session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Device label used in logs
    pub name: String,
    /// Minimum spacing between two sends
    pub min_poll_interval: Duration,
    /// Bounded wait for exclusive use of the session
    pub acquire_timeout: Duration,
    /// Timeout of a single transport read
    pub read_timeout: Duration,
    /// Overall budget for one reply
    pub receive_timeout: Duration,
    /// Budget for the wake reply during recovery
    pub wake_timeout: Duration,
    /// Send attempts per request, first one included
    pub attempts: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            name: "device".to_string(),
            min_poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            acquire_timeout: Duration::from_millis(DEFAULT_ACQUIRE_TIMEOUT_MS),
            read_timeout: Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
            receive_timeout: Duration::from_millis(DEFAULT_RECEIVE_TIMEOUT_MS),
            wake_timeout: Duration::from_millis(DEFAULT_WAKE_TIMEOUT_MS),
            attempts: DEFAULT_RETRIES,
        }
    }
}

/// Caller predicate deciding whether a decoded response is acceptable
pub type Validator = Arc<dyn Fn(&Response, u32) -> bool + Send + Sync>;

/// Attempt budget plus an optional validation predicate
#[derive(Clone)]
pub struct RetryPolicy {
    attempts: u32,
    validator: Option<Validator>,
}

impl RetryPolicy {
    /// `attempts` total sends; zero is treated as one
    pub fn new(attempts: u32) -> Self {
        Self {
            attempts: attempts.max(1),
            validator: None,
        }
    }

    /// Accept a response only when `validator(response, attempt)` holds.
    ///
    /// `attempt` starts at 1. With a validator installed, replies that have no
    /// registered decoder reach it as [`Response::Unrecognized`].
    pub fn with_validator<V>(mut self, validator: V) -> Self
    where
        V: Fn(&Response, u32) -> bool + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Total sends allowed per request
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether a validator is installed
    pub fn has_validator(&self) -> bool {
        self.validator.is_some()
    }

    /// Run the validator; true when none is installed
    pub fn accepts(&self, response: &Response, attempt: u32) -> bool {
        self.validator
            .as_ref()
            .map_or(true, |validate| validate(response, attempt))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RETRIES)
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("attempts", &self.attempts)
            .field("validator", &self.validator.is_some())
            .finish()
    }
}

/// Send spacing bookkeeping
#[derive(Debug, Clone, Copy)]
pub struct PollState {
    last_poll: Option<Instant>,
    min_interval: Duration,
}

impl PollState {
    /// No send recorded yet; the first send goes out at once
    pub fn new(min_interval: Duration) -> Self {
        Self {
            last_poll: None,
            min_interval,
        }
    }

    /// Minimum spacing between sends
    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// End of the most recent attempt, if any
    pub fn last_poll(&self) -> Option<Instant> {
        self.last_poll
    }

    /// How long to wait at `now` before the next send is allowed
    pub fn wait_time(&self, now: Instant) -> Duration {
        match self.last_poll {
            Some(last) => (last + self.min_interval).saturating_duration_since(now),
            None => Duration::ZERO,
        }
    }

    /// Record the end of an attempt, successful or not
    pub fn mark(&mut self, now: Instant) {
        self.last_poll = Some(now);
    }
}

/// Cumulative traffic of a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionCounters {
    /// Bytes written, wake frames included
    pub tx_bytes: u64,
    /// Bytes read
    pub rx_bytes: u64,
    /// Frames written, wake frames included
    pub tx_frames: u64,
    /// Complete replies received, before validation
    pub rx_frames: u64,
    /// Attempts beyond the first
    pub retries: u64,
    /// Close/reopen/wake cycles
    pub recoveries: u64,
}

impl SessionCounters {
    pub(crate) fn sent(&mut self, bytes: usize) {
        self.tx_bytes = self.tx_bytes.saturating_add(bytes as u64);
        self.tx_frames = self.tx_frames.saturating_add(1);
    }

    pub(crate) fn received(&mut self, bytes: usize) {
        self.rx_bytes = self.rx_bytes.saturating_add(bytes as u64);
    }
}

/// Outcome of a request at the boolean boundary
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Exchange {
    /// Whether a reply was accepted
    pub success: bool,
    /// Raw payload of the accepted reply
    pub payload: Option<Vec<u8>>,
    /// Decoded reply
    pub response: Option<Response>,
}

impl Exchange {
    pub(crate) fn failed() -> Self {
        Self::default()
    }

    /// Command went out and no reply was expected
    pub(crate) fn sent() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub(crate) fn accepted(payload: Vec<u8>, response: Response) -> Self {
        Self {
            success: true,
            payload: Some(payload),
            response: Some(response),
        }
    }
}

/// Collects reply bytes until the family's completion rule is met
#[derive(Debug)]
pub(crate) struct Accumulator {
    rule: ReceiveRule,
    buf: Vec<u8>,
}

impl Accumulator {
    pub(crate) fn new(rule: ReceiveRule) -> Self {
        Self {
            rule,
            buf: Vec::with_capacity(READ_CHUNK),
        }
    }

    /// Append bytes; true once the frame is complete
    pub(crate) fn push(&mut self, bytes: &[u8]) -> bool {
        self.buf.extend_from_slice(bytes);
        self.is_complete()
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.buf.len() >= MAX_FRAME_SIZE || self.rule.is_complete(&self.buf)
    }

    /// A read timing out with nothing new ends a quiet-delimited frame
    pub(crate) fn ends_on_silence(&self) -> bool {
        self.rule == ReceiveRule::Quiet && !self.buf.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Split a frame into writes no larger than the link's page size
pub(crate) fn pages(bytes: &[u8], page_size: Option<usize>) -> std::slice::Chunks<'_, u8> {
    let size = page_size.filter(|&n| n > 0).unwrap_or(bytes.len().max(1));
    bytes.chunks(size)
}

/// Decode, dispatch and validate one received reply
pub(crate) fn evaluate<F: FramingStrategy + ?Sized>(
    framing: &F,
    factory: &ResponseFactory,
    policy: &RetryPolicy,
    raw: &[u8],
    command: &Command,
    attempt: u32,
    device: &str,
) -> Result<Exchange, SessionError> {
    let frame = framing.decode(raw, command)?;
    let response = match factory.decode(&frame, policy.has_validator()) {
        Ok(response) => response,
        Err(DecodeError::Unrecognized(code)) => {
            warn!(device, %code, attempt, "No decoder registered for response");
            return Err(SessionError::UnrecognizedResponseType(code));
        }
        Err(e) => return Err(e.into()),
    };
    if !policy.accepts(&response, attempt) {
        debug!(device, attempt, "Response rejected by validator");
        return Err(SessionError::Rejected { attempts: attempt });
    }
    Ok(Exchange::accepted(frame.payload, response))
}

/// Log a failed attempt at a level matching its kind
pub(crate) fn log_attempt_failure(device: &str, command: &Command, attempt: u32, err: &SessionError) {
    match err {
        // Already reported at warn by `evaluate`
        SessionError::UnrecognizedResponseType(_) => {}
        SessionError::Transport(e) => {
            warn!(device, command = %command.code(), attempt, error = %e, "Transport failure")
        }
        other => debug!(device, command = %command.code(), attempt, error = %other, "Attempt failed"),
    }
}
