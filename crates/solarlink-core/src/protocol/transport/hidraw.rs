use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::time::Duration;

use tracing::debug;

use super::{ChannelState, Transport};
use crate::protocol::{TransportError, HID_PAGE_SIZE};

/// Wait until `file` is readable or `timeout` elapses
#[cfg(unix)]
fn wait_readable(file: &File, timeout: Duration) -> Result<bool, TransportError> {
    use std::os::unix::io::AsRawFd;

    let mut pfd = libc::pollfd {
        fd: file.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    let millis = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
    // SAFETY: `pfd` is a valid pollfd for the duration of the call and nfds is 1
    let rc = unsafe { libc::poll(&mut pfd, 1, millis) };
    match rc {
        -1 => Err(std::io::Error::last_os_error().into()),
        0 => Ok(false),
        _ => Ok(true),
    }
}

/// Without poll(2) a raw HID read simply blocks until the next report
#[cfg(not(unix))]
fn wait_readable(_file: &File, _timeout: Duration) -> Result<bool, TransportError> {
    Ok(true)
}

/// Raw HID device file channel (`/dev/hidrawN`), opened for read and write
pub struct HidRawTransport {
    path: String,
    page_size: usize,
    file: Option<File>,
    state: ChannelState,
}

impl HidRawTransport {
    /// Unopened device file at `path`
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            page_size: HID_PAGE_SIZE,
            file: None,
            state: ChannelState::Closed,
        }
    }

    /// Override the report size (at least 1)
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn file(&mut self) -> Result<&mut File, TransportError> {
        self.state.check_open()?;
        self.file.as_mut().ok_or(TransportError::NotOpen)
    }
}

impl Transport for HidRawTransport {
    fn open(&mut self) -> Result<(), TransportError> {
        self.state.check_usable()?;
        if self.state == ChannelState::Open {
            return Ok(());
        }
        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        debug!(path = %self.path, "hidraw channel open");
        self.file = Some(file);
        self.state = ChannelState::Open;
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.state.check_usable()?;
        if self.file.take().is_some() {
            debug!(path = %self.path, "hidraw channel closed");
        }
        self.state = ChannelState::Closed;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        let file = self.file()?;
        if !wait_readable(file, timeout)? {
            return Err(TransportError::TimedOut);
        }
        Ok(file.read(buf)?)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.file()?.write_all(bytes)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        self.file()?.flush()?;
        Ok(())
    }

    fn discard_input(&mut self) -> Result<(), TransportError> {
        let file = self.file()?;
        let mut report = [0u8; 64];
        while wait_readable(file, Duration::ZERO)? {
            if file.read(&mut report)? == 0 {
                break;
            }
        }
        Ok(())
    }

    fn dispose(&mut self) {
        self.file = None;
        self.state = ChannelState::Disposed;
    }

    fn is_open(&self) -> bool {
        self.state == ChannelState::Open
    }

    fn page_size(&self) -> Option<usize> {
        Some(self.page_size)
    }

    fn endpoint(&self) -> String {
        format!("hidraw://{}", self.path)
    }
}
