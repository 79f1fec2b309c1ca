//! Async session
//!
//! Same state machine as [`Session`](super::Session), suspended at the lock,
//! the throttle sleep and each read. The lock is a FIFO `tokio::sync::Mutex`,
//! so waiting callers are served in arrival order.
//!
//! Dropping a request future mid-receive leaves the transport half-read; the
//! session notices on the next call and recovers before sending.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{
    evaluate, log_attempt_failure, pages, Accumulator, Exchange, PollState, RetryPolicy,
    SessionConfig, SessionCounters, READ_CHUNK,
};
use crate::protocol::commands::Command;
use crate::protocol::frame::FramingStrategy;
use crate::protocol::transport::AsyncTransport;
use crate::protocol::{SessionDisposed, SessionError, TransportError};
use crate::response::ResponseFactory;

/// Monotonic now on tokio's clock, so paused-time tests throttle correctly
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

struct Inner<T> {
    transport: T,
    poll: PollState,
    counters: SessionCounters,
    needs_recovery: bool,
    disposed: bool,
}

/// Single-flight request/response session over an async transport
pub struct AsyncSession<T, F> {
    inner: Mutex<Inner<T>>,
    framing: F,
    factory: ResponseFactory,
    policy: RetryPolicy,
    config: SessionConfig,
    disposed: AtomicBool,
}

impl<T: AsyncTransport, F: FramingStrategy> AsyncSession<T, F> {
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
    pub async fn counters(&self) -> SessionCounters {
        self.inner.lock().await.counters
    }

    /// Open the transport ahead of the first request
    pub async fn open(&self) -> Result<(), SessionError> {
        let mut inner = self.acquire(&CancellationToken::new()).await?;
        inner.transport.open().await?;
        info!(device = %self.config.name, endpoint = %inner.transport.endpoint(), "Session open");
        Ok(())
    }

    /// Close and dispose the transport; later requests fail with [`SessionDisposed`]
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut inner = self.inner.lock().await;
        inner.disposed = true;
        inner.transport.dispose();
        info!(device = %self.config.name, "Session disposed");
    }

    /// Run a request, collapsing every recoverable failure into `success: false`
    pub async fn request(&self, command: &Command) -> Result<Exchange, SessionDisposed> {
        self.request_cancellable(command, &CancellationToken::new())
            .await
    }

    /// [`request`](Self::request) that gives up when `cancel` fires
    pub async fn request_cancellable(
        &self,
        command: &Command,
        cancel: &CancellationToken,
    ) -> Result<Exchange, SessionDisposed> {
        match self.execute_cancellable(command, cancel).await {
            Ok(exchange) => Ok(exchange),
            Err(SessionError::Disposed) => Err(SessionDisposed),
            Err(e) => {
                debug!(device = %self.config.name, command = %command.code(), error = %e, "Request failed");
                Ok(Exchange::failed())
            }
        }
    }

    /// Run a request and report the typed failure
    pub async fn execute(&self, command: &Command) -> Result<Exchange, SessionError> {
        self.execute_cancellable(command, &CancellationToken::new())
            .await
    }

    /// [`execute`](Self::execute) that gives up when `cancel` fires
    pub async fn execute_cancellable(
        &self,
        command: &Command,
        cancel: &CancellationToken,
    ) -> Result<Exchange, SessionError> {
        let mut inner = self.acquire(cancel).await?;
        self.run(&mut inner, command, cancel).await
    }

    async fn acquire(
        &self,
        cancel: &CancellationToken,
    ) -> Result<MutexGuard<'_, Inner<T>>, SessionError> {
        if self.is_disposed() {
            return Err(SessionError::Disposed);
        }
        let timeout = self.config.acquire_timeout;
        let guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SessionError::Cancelled),
            locked = tokio::time::timeout(timeout, self.inner.lock()) => match locked {
                Ok(guard) => guard,
                Err(_) => {
                    debug!(device = %self.config.name, "Session busy");
                    return Err(SessionError::BusyTimeout(timeout));
                }
            },
        };
        if guard.disposed {
            return Err(SessionError::Disposed);
        }
        Ok(guard)
    }

    async fn run(
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
                self.recover(inner).await?;
            }
            self.throttle(inner, cancel).await?;

            let result = self.exchange(inner, command, attempt, cancel).await;
            inner.poll.mark(now());

            match result {
                Ok(exchange) => return Ok(exchange),
                Err(SessionError::Cancelled) => {
                    if inner.needs_recovery {
                        self.recover(inner).await?;
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

    async fn exchange(
        &self,
        inner: &mut Inner<T>,
        command: &Command,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> Result<Exchange, SessionError> {
        inner.needs_recovery = true;
        inner.transport.open().await?;
        inner.transport.discard_input().await?;

        let bytes = self.framing.encode(command);
        self.send(inner, &bytes).await?;
        debug!(device = %self.config.name, command = %command.code(), attempt, "Request sent");

        if !command.expects_reply() {
            inner.needs_recovery = false;
            return Ok(Exchange::sent());
        }

        let raw = self
            .receive(inner, self.config.receive_timeout, Some(cancel))
            .await?;
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

    async fn send(&self, inner: &mut Inner<T>, bytes: &[u8]) -> Result<(), TransportError> {
        trace!(device = %self.config.name, "tx {:02x?}", bytes);
        let page_size = inner.transport.page_size();
        for page in pages(bytes, page_size) {
            inner.transport.write(page).await?;
            inner.transport.flush().await?;
        }
        inner.counters.sent(bytes.len());
        Ok(())
    }

    async fn receive(
        &self,
        inner: &mut Inner<T>,
        budget: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<u8>, SessionError> {
        let deadline = tokio::time::Instant::now() + budget;
        let mut acc = Accumulator::new(self.framing.receive_rule());
        let mut buf = [0u8; READ_CHUNK];

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                debug!(device = %self.config.name, received = acc.len(), "Receive timed out");
                return Err(TransportError::TimedOut.into());
            }
            let read = inner
                .transport
                .read(&mut buf, self.config.read_timeout.min(remaining));
            let result = match cancel {
                Some(cancel) => tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(SessionError::Cancelled),
                    result = read => result,
                },
                None => read.await,
            };

            match result {
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

    async fn recover(&self, inner: &mut Inner<T>) -> Result<(), SessionError> {
        let device = self.config.name.as_str();
        info!(device, endpoint = %inner.transport.endpoint(), "Recovering transport");
        inner.counters.recoveries += 1;

        if let Err(e) = inner.transport.close().await {
            debug!(device, error = %e, "Close during recovery failed");
        }
        inner
            .transport
            .open()
            .await
            .map_err(SessionError::RecoveryFailed)?;

        let wait = inner.poll.wait_time(now());
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        let wake = self.framing.wake_frame();
        let sent = self.send(inner, &wake).await;
        inner.poll.mark(now());
        sent.map_err(SessionError::RecoveryFailed)?;

        match self.receive(inner, self.config.wake_timeout, None).await {
            Ok(reply) => trace!(device, bytes = reply.len(), "Wake reply discarded"),
            Err(e) => debug!(device, error = %e, "No wake reply"),
        }
        inner.poll.mark(now());
        inner
            .transport
            .discard_input()
            .await
            .map_err(SessionError::RecoveryFailed)?;

        inner.needs_recovery = false;
        Ok(())
    }

    async fn throttle(&self, inner: &Inner<T>, cancel: &CancellationToken) -> Result<(), SessionError> {
        let wait = inner.poll.wait_time(now());
        if !wait.is_zero() {
            trace!(device = %self.config.name, wait_ms = wait.as_millis() as u64, "Throttling");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SessionError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
        if cancel.is_cancelled() {
            return Err(SessionError::Cancelled);
        }
        Ok(())
    }
}
