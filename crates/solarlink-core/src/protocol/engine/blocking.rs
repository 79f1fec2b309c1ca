//! Blocking session

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{
    evaluate, log_attempt_failure, pages, Accumulator, Exchange, PollState, RetryPolicy,
    SessionConfig, SessionCounters, READ_CHUNK,
};
use crate::protocol::commands::Command;
use crate::protocol::frame::FramingStrategy;
use crate::protocol::transport::Transport;
use crate::protocol::{SessionDisposed, SessionError, TransportError};
use crate::response::ResponseFactory;

/// Granularity of cancellable waits
const CANCEL_POLL: Duration = Duration::from_millis(10);

struct Inner<T> {
    transport: T,
    poll: PollState,
    counters: SessionCounters,
    /// A receive was interrupted; reopen before the next send
    needs_recovery: bool,
    disposed: bool,
}

/// Single-flight request/response session over a blocking transport.
///
/// `Session` is `Sync`: share it behind an `Arc` and concurrent callers are
/// serialized on an internal lock, each waiting at most
/// [`SessionConfig::acquire_timeout`].
pub struct Session<T, F> {
    inner: Mutex<Inner<T>>,
    framing: F,
    factory: ResponseFactory,
    policy: RetryPolicy,
    config: SessionConfig,
    disposed: AtomicBool,
}

impl<T: Transport, F: FramingStrategy> Session<T, F> {
    /// Session over a not-yet-opened `transport`
    pub fn new(transport: T, framing: F, config: SessionConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                transport,
                poll: PollState::new(config.min_poll_interval),
                counters: SessionCounters::default(),
                needs_recovery: false,
                disposed: false,
            }),
            framing,
            factory: ResponseFactory::default(),
            policy: RetryPolicy::new(config.attempts),
            config,
            disposed: AtomicBool::new(false),
        }
    }

    /// Replace the attempt budget and validator
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Replace the decoder table
    pub fn with_factory(mut self, factory: ResponseFactory) -> Self {
        self.factory = factory;
        self
    }

    /// Timing and naming in use
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Wire format in use
    pub fn framing(&self) -> &F {
        &self.framing
    }

    /// Whether `dispose` has been called
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Traffic counters; waits for any in-flight request
    pub fn counters(&self) -> SessionCounters {
        self.inner.lock().counters
    }

    /// Open the transport ahead of the first request
    pub fn open(&self) -> Result<(), SessionError> {
        let mut inner = self.acquire(&CancellationToken::new())?;
        inner.transport.open()?;
        info!(device = %self.config.name, endpoint = %inner.transport.endpoint(), "Session open");
        Ok(())
    }

    /// Close and dispose the transport; later requests fail with [`SessionDisposed`]
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut inner = self.inner.lock();
        inner.disposed = true;
        inner.transport.dispose();
        info!(device = %self.config.name, "Session disposed");
    }

    /// Run a request, collapsing every recoverable failure into `success: false`
    pub fn request(&self, command: &Command) -> Result<Exchange, SessionDisposed> {
        self.request_cancellable(command, &CancellationToken::new())
    }

    /// [`request`](Self::request) that gives up when `cancel` fires
    pub fn request_cancellable(
        &self,
        command: &Command,
        cancel: &CancellationToken,
    ) -> Result<Exchange, SessionDisposed> {
        match self.execute_cancellable(command, cancel) {
            Ok(exchange) => Ok(exchange),
            Err(SessionError::Disposed) => Err(SessionDisposed),
            Err(e) => {
                debug!(device = %self.config.name, command = %command.code(), error = %e, "Request failed");
                Ok(Exchange::failed())
            }
        }
    }

    /// Run a request and report the typed failure
    pub fn execute(&self, command: &Command) -> Result<Exchange, SessionError> {
        self.execute_cancellable(command, &CancellationToken::new())
    }

    /// [`execute`](Self::execute) that gives up when `cancel` fires
    pub fn execute_cancellable(
        &self,
        command: &Command,
        cancel: &CancellationToken,
    ) -> Result<Exchange, SessionError> {
        let mut inner = self.acquire(cancel)?;
        self.run(&mut inner, command, cancel)
    }

    /// Bounded wait for the session lock, abandoned early on cancellation
    fn acquire(&self, cancel: &CancellationToken) -> Result<MutexGuard<'_, Inner<T>>, SessionError> {
        if self.is_disposed() {
            return Err(SessionError::Disposed);
        }
        let deadline = Instant::now() + self.config.acquire_timeout;
        loop {
            if cancel.is_cancelled() {
                return Err(SessionError::Cancelled);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if let Some(guard) = self.inner.try_lock_for(remaining.min(CANCEL_POLL)) {
                if guard.disposed {
                    return Err(SessionError::Disposed);
                }
                return Ok(guard);
            }
            if remaining.is_zero() {
                debug!(device = %self.config.name, "Session busy");
                return Err(SessionError::BusyTimeout(self.config.acquire_timeout));
            }
        }
    }

    fn run(
        &self,
        inner: &mut Inner<T>,
        command: &Command,
        cancel: &CancellationToken,
    ) -> Result<Exchange, SessionError> {
        let device = self.config.name.as_str();
        let attempts = self.policy.attempts();
        let mut last_err = SessionError::Rejected { attempts };

        for attempt in 1..=attempts {
            if attempt > 1 {
                inner.counters.retries += 1;
            }
            if inner.needs_recovery {
                self.recover(inner)?;
            }
            self.throttle(inner, cancel)?;

            match self.attempt(inner, command, attempt, cancel) {
                Ok(exchange) => return Ok(exchange),
                Err(SessionError::Cancelled) => {
                    if inner.needs_recovery {
                        // Leave the device usable for the next caller
                        self.recover(inner)?;
                    }
                    return Err(SessionError::Cancelled);
                }
                Err(e) if e.is_retryable() => {
                    log_attempt_failure(device, command, attempt, &e);
                    last_err = e;
                }
                Err(e) => return Err(e),
            }
        }

        warn!(device, command = %command.code(), attempts, error = %last_err, "Request failed");
        Err(last_err)
    }

    /// One send/receive/validate cycle; marks the poll state whatever happens
    fn attempt(
        &self,
        inner: &mut Inner<T>,
        command: &Command,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> Result<Exchange, SessionError> {
        let result = self.exchange(inner, command, attempt, cancel);
        inner.poll.mark(Instant::now());
        result
    }

    fn exchange(
        &self,
        inner: &mut Inner<T>,
        command: &Command,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> Result<Exchange, SessionError> {
        inner.needs_recovery = true;
        inner.transport.open()?;
        inner.transport.discard_input()?;

        let bytes = self.framing.encode(command);
        self.send(inner, &bytes)?;
        debug!(device = %self.config.name, command = %command.code(), attempt, "Request sent");

        if !command.expects_reply() {
            inner.needs_recovery = false;
            return Ok(Exchange::sent());
        }

        let raw = self.receive(inner, self.config.receive_timeout, Some(cancel))?;
        inner.needs_recovery = false;
        inner.counters.rx_frames += 1;

        evaluate(
            &self.framing,
            &self.factory,
            &self.policy,
            &raw,
            command,
            attempt,
            &self.config.name,
        )
    }

    fn send(&self, inner: &mut Inner<T>, bytes: &[u8]) -> Result<(), TransportError> {
        trace!(device = %self.config.name, "tx {:02x?}", bytes);
        let page_size = inner.transport.page_size();
        for page in pages(bytes, page_size) {
            inner.transport.write(page)?;
            inner.transport.flush()?;
        }
        inner.counters.sent(bytes.len());
        Ok(())
    }

    /// Accumulate a reply under the family's completion rule within `budget`
    fn receive(
        &self,
        inner: &mut Inner<T>,
        budget: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<u8>, SessionError> {
        let deadline = Instant::now() + budget;
        let mut acc = Accumulator::new(self.framing.receive_rule());
        let mut buf = [0u8; READ_CHUNK];

        loop {
            if cancel.is_some_and(|c| c.is_cancelled()) {
                return Err(SessionError::Cancelled);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!(device = %self.config.name, received = acc.len(), "Receive timed out");
                return Err(TransportError::TimedOut.into());
            }
            match inner
                .transport
                .read(&mut buf, self.config.read_timeout.min(remaining))
            {
                Ok(0) => return Err(TransportError::Closed.into()),
                Ok(n) => {
                    inner.counters.received(n);
                    trace!(device = %self.config.name, "rx {:02x?}", &buf[..n]);
                    if acc.push(&buf[..n]) {
                        return Ok(acc.into_bytes());
                    }
                }
                Err(TransportError::TimedOut) if acc.ends_on_silence() => {
                    return Ok(acc.into_bytes());
                }
                Err(TransportError::TimedOut) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Close, reopen and wake the device after an interrupted exchange
    fn recover(&self, inner: &mut Inner<T>) -> Result<(), SessionError> {
        let device = self.config.name.as_str();
        info!(device, endpoint = %inner.transport.endpoint(), "Recovering transport");
        inner.counters.recoveries += 1;

        if let Err(e) = inner.transport.close() {
            debug!(device, error = %e, "Close during recovery failed");
        }
        inner
            .transport
            .open()
            .map_err(SessionError::RecoveryFailed)?;

        // The wake frame is a send like any other
        let wait = inner.poll.wait_time(Instant::now());
        if !wait.is_zero() {
            std::thread::sleep(wait);
        }
        let wake = self.framing.wake_frame();
        let sent = self.send(inner, &wake);
        inner.poll.mark(Instant::now());
        sent.map_err(SessionError::RecoveryFailed)?;

        match self.receive(inner, self.config.wake_timeout, None) {
            Ok(reply) => trace!(device, bytes = reply.len(), "Wake reply discarded"),
            Err(e) => debug!(device, error = %e, "No wake reply"),
        }
        inner.poll.mark(Instant::now());
        inner
            .transport
            .discard_input()
            .map_err(SessionError::RecoveryFailed)?;

        inner.needs_recovery = false;
        Ok(())
    }

    /// Wait out the poll interval since the last attempt
    fn throttle(&self, inner: &Inner<T>, cancel: &CancellationToken) -> Result<(), SessionError> {
        let mut wait = inner.poll.wait_time(Instant::now());
        if !wait.is_zero() {
            trace!(device = %self.config.name, wait_ms = wait.as_millis() as u64, "Throttling");
        }
        while !wait.is_zero() {
            if cancel.is_cancelled() {
                return Err(SessionError::Cancelled);
            }
            std::thread::sleep(wait.min(CANCEL_POLL));
            wait = inner.poll.wait_time(Instant::now());
        }
        if cancel.is_cancelled() {
            return Err(SessionError::Cancelled);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::protocol::commands::{mos_control, BmsRegister, CommandCode, Family};
    use crate::protocol::frame::{BmsFraming, Frame, BMS_START};

    /// Answers each write with the next scripted reply; `None` stays silent
    #[derive(Default)]
    struct Scripted {
        open: bool,
        opens: u32,
        replies: VecDeque<Option<Vec<u8>>>,
        pending: VecDeque<u8>,
        writes: Vec<Vec<u8>>,
    }

    impl Transport for Scripted {
        fn open(&mut self) -> Result<(), TransportError> {
            if !self.open {
                self.open = true;
                self.opens += 1;
            }
            Ok(())
        }
        fn close(&mut self) -> Result<(), TransportError> {
            self.open = false;
            Ok(())
        }
        fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
            if self.pending.is_empty() {
                std::thread::sleep(timeout);
                return Err(TransportError::TimedOut);
            }
            let n = buf.len().min(self.pending.len());
            for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }
        fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
            self.writes.push(bytes.to_vec());
            if let Some(Some(reply)) = self.replies.pop_front() {
                self.pending.extend(reply);
            }
            Ok(())
        }
        fn flush(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
        fn discard_input(&mut self) -> Result<(), TransportError> {
            self.pending.clear();
            Ok(())
        }
        fn dispose(&mut self) {
            self.open = false;
        }
        fn is_open(&self) -> bool {
            self.open
        }
        fn endpoint(&self) -> String {
            "scripted".to_string()
        }
    }

    fn fast_config() -> SessionConfig {
        SessionConfig {
            name: "unit".to_string(),
            min_poll_interval: Duration::from_millis(5),
            acquire_timeout: Duration::from_millis(50),
            read_timeout: Duration::from_millis(5),
            receive_timeout: Duration::from_millis(20),
            wake_timeout: Duration::from_millis(10),
            attempts: 2,
        }
    }

    fn cell_reply() -> Vec<u8> {
        BmsFraming.encode_reply(&Frame {
            family: Family::Bms,
            marker: BMS_START,
            code: CommandCode::Register(0x04),
            payload: vec![0x0E, 0x2E],
            crc: [0, 0],
        })
    }

    #[test]
    fn test_timeout_then_recovery() {
        let mut transport = Scripted::default();
        // request: silence, wake: answered, retry: answered
        transport.replies.extend([None, Some(cell_reply()), Some(cell_reply())]);
        let session = Session::new(transport, BmsFraming, fast_config());

        let exchange = session.execute(&BmsRegister::CellVoltages.into()).unwrap();
        assert!(exchange.success);
        assert_eq!(exchange.payload, Some(vec![0x0E, 0x2E]));

        let counters = session.counters();
        assert_eq!(counters.recoveries, 1);
        assert_eq!(counters.retries, 1);

        let inner = session.inner.lock();
        assert_eq!(inner.transport.opens, 2);
        assert_eq!(inner.transport.writes.len(), 3);
        assert_eq!(inner.transport.writes[1], BmsFraming.wake_frame());
    }

    #[test]
    fn test_timeout_on_last_attempt_recovers_next_call() {
        let mut transport = Scripted::default();
        transport.replies.push_back(None);
        let session = Session::new(transport, BmsFraming, fast_config())
            .with_retry_policy(RetryPolicy::new(1));

        let err = session
            .execute(&BmsRegister::CellVoltages.into())
            .unwrap_err();
        assert!(matches!(err, SessionError::Transport(TransportError::TimedOut)));
        assert_eq!(session.counters().recoveries, 0);

        session.inner.lock().transport.replies.extend([None, Some(cell_reply())]);
        assert!(session.request(&BmsRegister::CellVoltages.into()).unwrap().success);
        assert_eq!(session.counters().recoveries, 1);
    }

    #[test]
    fn test_disposed_session() {
        let session = Session::new(Scripted::default(), BmsFraming, fast_config());
        session.dispose();
        let command: Command = BmsRegister::BasicInfo.into();
        assert_eq!(session.request(&command), Err(SessionDisposed));
        assert!(matches!(session.execute(&command), Err(SessionError::Disposed)));
    }

    #[test]
    fn test_busy_timeout_leaves_transport_alone() {
        let session = Session::new(Scripted::default(), BmsFraming, fast_config());
        let guard = session.inner.lock();
        let err = session
            .execute(&BmsRegister::BasicInfo.into())
            .unwrap_err();
        assert!(matches!(err, SessionError::BusyTimeout(_)));
        assert!(guard.transport.writes.is_empty());
    }

    #[test]
    fn test_cancelled_before_acquire() {
        let session = Session::new(Scripted::default(), BmsFraming, fast_config());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = session
            .execute_cancellable(&BmsRegister::BasicInfo.into(), &cancel)
            .unwrap_err();
        assert!(matches!(err, SessionError::Cancelled));
        assert!(session.inner.lock().transport.writes.is_empty());
    }

    #[test]
    fn test_write_without_reply() {
        let session = Session::new(Scripted::default(), BmsFraming, fast_config());
        let exchange = session
            .execute(&mos_control(true, false).without_reply())
            .unwrap();
        assert!(exchange.success);
        assert_eq!(exchange.payload, None);
        assert_eq!(session.counters().tx_frames, 1);
    }
}
