use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::debug;

use super::{map_read_error, ChannelState, Transport};
use crate::protocol::{TransportError, DEFAULT_CONNECT_TIMEOUT_MS};

/// TCP stream channel (BMS behind a serial-to-network bridge)
pub struct TcpTransport {
    host: String,
    port: u16,
    connect_timeout: Duration,
    stream: Option<TcpStream>,
    state: ChannelState,
}

impl TcpTransport {
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

    /// Bound the connect step
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn stream(&mut self) -> Result<&mut TcpStream, TransportError> {
        self.state.check_open()?;
        self.stream.as_mut().ok_or(TransportError::NotOpen)
    }
}

impl Transport for TcpTransport {
    fn open(&mut self) -> Result<(), TransportError> {
        self.state.check_usable()?;
        if self.state == ChannelState::Open {
            return Ok(());
        }

        let addr = (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("cannot resolve {}", self.host))
            })?;
        let stream = TcpStream::connect_timeout(&addr, self.connect_timeout)?;
        stream.set_nodelay(true)?;
        debug!(endpoint = %self.endpoint(), "tcp channel open");

        self.stream = Some(stream);
        self.state = ChannelState::Open;
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.state.check_usable()?;
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
            debug!(endpoint = %self.endpoint(), "tcp channel closed");
        }
        self.state = ChannelState::Closed;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        let stream = self.stream()?;
        // A zero read timeout means "block forever" to the socket API
        stream.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        stream.read(buf).map_err(map_read_error)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.stream()?.write_all(bytes)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        self.stream()?.flush()?;
        Ok(())
    }

    fn discard_input(&mut self) -> Result<(), TransportError> {
        // TCP has no "clear buffer" call: drain with non-blocking reads until WouldBlock
        let stream = self.stream()?;
        stream.set_nonblocking(true)?;
        let mut buf = [0u8; 1024];
        let result = loop {
            match stream.read(&mut buf) {
                Ok(0) => break Ok(()),
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        stream.set_nonblocking(false)?;
        result.map_err(TransportError::from)
    }

    fn dispose(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        self.state = ChannelState::Disposed;
    }

    fn is_open(&self) -> bool {
        self.state == ChannelState::Open
    }

    fn endpoint(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }
}
