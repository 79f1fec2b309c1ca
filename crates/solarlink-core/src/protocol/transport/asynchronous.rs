//! Tokio transport channels
//!
//! Same semantics as the blocking [`Transport`](super::Transport): reads are bounded by
//! `tokio::time::timeout`, so a timed-out or cancelled read may leave the device half-read.
//! The engine recovers from that by closing and reopening the channel.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::{debug, warn};

use super::{map_read_error, ChannelState, HidRawTransport, SerialSettings, Transport};
use crate::protocol::{TransportError, DEFAULT_CONNECT_TIMEOUT_MS, HID_PAGE_SIZE};

/// Cooperative transport channel
#[async_trait]
pub trait AsyncTransport: Send {
    /// Open the channel; no-op when already open
    async fn open(&mut self) -> Result<(), TransportError>;

    /// Close the channel; no-op when not open
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Read available bytes, waiting at most `timeout`
    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Write all of `bytes`
    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Push buffered output to the device
    async fn flush(&mut self) -> Result<(), TransportError>;

    /// Drop stale bytes waiting in the input buffer
    async fn discard_input(&mut self) -> Result<(), TransportError>;

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

#[async_trait]
impl<T: AsyncTransport + ?Sized> AsyncTransport for Box<T> {
    async fn open(&mut self) -> Result<(), TransportError> {
        (**self).open().await
    }
    async fn close(&mut self) -> Result<(), TransportError> {
        (**self).close().await
    }
    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        (**self).read(buf, timeout).await
    }
    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        (**self).write(bytes).await
    }
    async fn flush(&mut self) -> Result<(), TransportError> {
        (**self).flush().await
    }
    async fn discard_input(&mut self) -> Result<(), TransportError> {
        (**self).discard_input().await
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

async fn read_with_timeout<R>(
    reader: &mut R,
    buf: &mut [u8],
    timeout: Duration,
) -> Result<usize, TransportError>
where
    R: AsyncReadExt + Unpin + ?Sized,
{
    match tokio::time::timeout(timeout, reader.read(buf)).await {
        Ok(result) => result.map_err(map_read_error),
        Err(_) => Err(TransportError::TimedOut),
    }
}

/// Tokio TCP stream channel
pub struct AsyncTcpTransport {
    host: String,
    port: u16,
    connect_timeout: Duration,
    stream: Option<TcpStream>,
    state: ChannelState,
}

impl AsyncTcpTransport {
    /// Unconnected channel to `host:port`
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            stream: None,
            state: ChannelState::Closed,
        }
    }

    fn stream(&mut self) -> Result<&mut TcpStream, TransportError> {
        self.state.check_open()?;
        self.stream.as_mut().ok_or(TransportError::NotOpen)
    }
}

#[async_trait]
impl AsyncTransport for AsyncTcpTransport {
    async fn open(&mut self) -> Result<(), TransportError> {
        self.state.check_usable()?;
        if self.state == ChannelState::Open {
            return Ok(());
        }
        let connect = TcpStream::connect((self.host.as_str(), self.port));
        let stream = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| TransportError::TimedOut)??;
        stream.set_nodelay(true)?;
        debug!(endpoint = %self.endpoint(), "tcp channel open");
        self.stream = Some(stream);
        self.state = ChannelState::Open;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.state.check_usable()?;
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            debug!(endpoint = %self.endpoint(), "tcp channel closed");
        }
        self.state = ChannelState::Closed;
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        read_with_timeout(self.stream()?, buf, timeout).await
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.stream()?.write_all(bytes).await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), TransportError> {
        self.stream()?.flush().await?;
        Ok(())
    }

    async fn discard_input(&mut self) -> Result<(), TransportError> {
        let stream = self.stream()?;
        let mut buf = [0u8; 1024];
        loop {
            match stream.try_read(&mut buf) {
                Ok(0) => return Ok(()),
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn dispose(&mut self) {
        self.stream = None;
        self.state = ChannelState::Disposed;
    }

    fn is_open(&self) -> bool {
        self.state == ChannelState::Open
    }

    fn endpoint(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }
}

/// tokio-serial channel
pub struct AsyncSerialTransport {
    path: String,
    settings: SerialSettings,
    port: Option<SerialStream>,
    state: ChannelState,
}

impl AsyncSerialTransport {
    /// Unopened port at `path`
    pub fn new(path: impl Into<String>, settings: SerialSettings) -> Self {
        Self {
            path: path.into(),
            settings,
            port: None,
            state: ChannelState::Closed,
        }
    }

    fn port(&mut self) -> Result<&mut SerialStream, TransportError> {
        self.state.check_open()?;
        self.port.as_mut().ok_or(TransportError::NotOpen)
    }
}

#[async_trait]
impl AsyncTransport for AsyncSerialTransport {
    async fn open(&mut self) -> Result<(), TransportError> {
        self.state.check_usable()?;
        if self.state == ChannelState::Open {
            return Ok(());
        }
        let mut port = tokio_serial::new(&self.path, self.settings.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| TransportError::Serial(e.to_string()))?;
        if let Err(e) = port.write_data_terminal_ready(true) {
            warn!("failed to set DTR high: {e} (continuing)");
        }
        debug!(path = %self.path, baud = self.settings.baud_rate, "serial channel open");
        self.port = Some(port);
        self.state = ChannelState::Open;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.state.check_usable()?;
        if self.port.take().is_some() {
            debug!(path = %self.path, "serial channel closed");
        }
        self.state = ChannelState::Closed;
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        read_with_timeout(self.port()?, buf, timeout).await
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.port()?.write_all(bytes).await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), TransportError> {
        self.port()?.flush().await?;
        Ok(())
    }

    async fn discard_input(&mut self) -> Result<(), TransportError> {
        self.port()?
            .clear(tokio_serial::ClearBuffer::Input)
            .map_err(|e| TransportError::Serial(e.to_string()))?;
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

/// Raw HID device file channel.
///
/// Each operation runs the blocking [`HidRawTransport`] on tokio's blocking pool. If the
/// awaiting future is dropped mid-read, the channel loses its handle and reports
/// [`TransportError::NotOpen`] until it is closed and reopened.
pub struct AsyncHidRawTransport {
    path: String,
    inner: Option<HidRawTransport>,
    state: ChannelState,
}

impl AsyncHidRawTransport {
    /// Unopened device file at `path`
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            inner: None,
            state: ChannelState::Closed,
        }
    }

    async fn blocking<R, F>(&mut self, op: F) -> Result<R, TransportError>
    where
        R: Send + 'static,
        F: FnOnce(&mut HidRawTransport) -> Result<R, TransportError> + Send + 'static,
    {
        self.state.check_open()?;
        let mut inner = self.inner.take().ok_or(TransportError::NotOpen)?;
        let (inner, result) = tokio::task::spawn_blocking(move || {
            let result = op(&mut inner);
            (inner, result)
        })
        .await
        .map_err(|e| TransportError::Io(std::io::Error::other(e)))?;
        self.inner = Some(inner);
        result
    }
}

#[async_trait]
impl AsyncTransport for AsyncHidRawTransport {
    async fn open(&mut self) -> Result<(), TransportError> {
        self.state.check_usable()?;
        if self.state == ChannelState::Open {
            return Ok(());
        }
        let mut inner = HidRawTransport::new(self.path.clone());
        inner.open()?;
        self.inner = Some(inner);
        self.state = ChannelState::Open;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.state.check_usable()?;
        if let Some(mut inner) = self.inner.take() {
            inner.close()?;
        }
        self.state = ChannelState::Closed;
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        let len = buf.len();
        let data = self
            .blocking(move |hid| {
                let mut report = vec![0u8; len];
                let n = hid.read(&mut report, timeout)?;
                report.truncate(n);
                Ok(report)
            })
            .await?;
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let bytes = bytes.to_vec();
        self.blocking(move |hid| hid.write(&bytes)).await
    }

    async fn flush(&mut self) -> Result<(), TransportError> {
        self.blocking(|hid| hid.flush()).await
    }

    async fn discard_input(&mut self) -> Result<(), TransportError> {
        self.blocking(|hid| hid.discard_input()).await
    }

    fn dispose(&mut self) {
        if let Some(mut inner) = self.inner.take() {
            inner.dispose();
        }
        self.state = ChannelState::Disposed;
    }

    fn is_open(&self) -> bool {
        self.state == ChannelState::Open && self.inner.is_some()
    }

    fn page_size(&self) -> Option<usize> {
        Some(HID_PAGE_SIZE)
    }

    fn endpoint(&self) -> String {
        format!("hidraw://{}", self.path)
    }
}
