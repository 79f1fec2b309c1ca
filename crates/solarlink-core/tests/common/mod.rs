//! Shared test doubles
//!
//! `MockLink` plays the device: it reassembles request frames from the
//! engine's (possibly paged) writes, logs them with a timestamp and queues the
//! scripted reply for the next reads.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use solarlink_core::protocol::frame::{Frame, BMS_START, INVERTER_START};
use solarlink_core::protocol::{
    AsyncTransport, BmsFraming, Command, CommandCode, Family, FramingStrategy, InverterFraming,
    Transport, TransportError,
};

/// What the device does with one request frame
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Queue these bytes for reading
    Reply(Vec<u8>),
    /// Say nothing; reads time out
    Silent,
}

/// A request frame as the device saw it
#[derive(Debug, Clone)]
pub struct SentFrame {
    pub at: Instant,
    pub bytes: Vec<u8>,
}

#[derive(Debug)]
pub struct MockState {
    pub open: bool,
    pub opens: u32,
    pub closes: u32,
    pub disposed: bool,
    pub fail_open: bool,
    pub frames: Vec<SentFrame>,
    pub chunk_sizes: Vec<usize>,
    pub read_sizes: Vec<usize>,
    pub script: VecDeque<Behavior>,
    pub fallback: Behavior,
    tx: Vec<u8>,
    rx: VecDeque<u8>,
}

impl MockState {
    /// Frames other than the wake frame
    pub fn requests(&self, wake: &[u8]) -> Vec<&SentFrame> {
        self.frames.iter().filter(|f| f.bytes != wake).collect()
    }
}

/// Scripted device behind a transport
#[derive(Clone)]
pub struct MockLink {
    framing: Arc<dyn FramingStrategy>,
    page_size: Option<usize>,
    read_chunk: Option<usize>,
    state: Arc<Mutex<MockState>>,
}

impl MockLink {
    pub fn new(framing: impl FramingStrategy + 'static) -> Self {
        Self {
            framing: Arc::new(framing),
            page_size: None,
            read_chunk: None,
            state: Arc::new(Mutex::new(MockState {
                open: false,
                opens: 0,
                closes: 0,
                disposed: false,
                fail_open: false,
                frames: Vec::new(),
                chunk_sizes: Vec::new(),
                read_sizes: Vec::new(),
                script: VecDeque::new(),
                fallback: Behavior::Silent,
                tx: Vec::new(),
                rx: VecDeque::new(),
            })),
        }
    }

    pub fn bms() -> Self {
        Self::new(BmsFraming)
    }

    pub fn inverter(hid: bool) -> Self {
        Self::new(InverterFraming::new(hid))
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size);
        self
    }

    /// Hand out at most `n` reply bytes per read, like a slow serial line
    pub fn with_read_chunk(mut self, n: usize) -> Self {
        self.read_chunk = Some(n.max(1));
        self
    }

    pub fn script(self, behaviors: impl IntoIterator<Item = Behavior>) -> Self {
        self.state().script.extend(behaviors);
        self
    }

    pub fn fallback(self, behavior: Behavior) -> Self {
        self.state().fallback = behavior;
        self
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    fn frame_complete(&self, tx: &[u8]) -> bool {
        tx == self.framing.wake_frame().as_slice() || self.framing.decode_request(tx).is_ok()
    }

    fn do_open(&self) -> Result<(), TransportError> {
        let mut state = self.state();
        if state.disposed {
            return Err(TransportError::Disposed);
        }
        if state.fail_open {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "device unplugged",
            )));
        }
        if !state.open {
            state.open = true;
            state.opens += 1;
        }
        Ok(())
    }

    fn do_close(&self) -> Result<(), TransportError> {
        let mut state = self.state();
        if state.open {
            state.open = false;
            state.closes += 1;
            state.tx.clear();
            state.rx.clear();
        }
        Ok(())
    }

    /// Non-blocking read; `None` when nothing is buffered
    fn try_read(&self, buf: &mut [u8]) -> Result<Option<usize>, TransportError> {
        let mut state = self.state();
        if state.disposed {
            return Err(TransportError::Disposed);
        }
        if !state.open {
            return Err(TransportError::NotOpen);
        }
        if state.rx.is_empty() {
            return Ok(None);
        }
        let n = buf
            .len()
            .min(state.rx.len())
            .min(self.read_chunk.unwrap_or(usize::MAX));
        for (slot, byte) in buf.iter_mut().zip(state.rx.drain(..n)) {
            *slot = byte;
        }
        state.read_sizes.push(n);
        Ok(Some(n))
    }

    fn do_write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state();
        if !state.open {
            return Err(TransportError::NotOpen);
        }
        if let Some(limit) = self.page_size {
            assert!(bytes.len() <= limit, "write of {} bytes exceeds page", bytes.len());
        }
        state.chunk_sizes.push(bytes.len());
        state.tx.extend_from_slice(bytes);

        let tx = state.tx.clone();
        if self.frame_complete(&tx) {
            state.tx.clear();
            state.frames.push(SentFrame {
                at: Instant::now(),
                bytes: tx,
            });
            let behavior = match state.script.pop_front() {
                Some(behavior) => behavior,
                None => state.fallback.clone(),
            };
            if let Behavior::Reply(reply) = behavior {
                state.rx.extend(reply);
            }
        }
        Ok(())
    }

    fn do_discard(&self) -> Result<(), TransportError> {
        let mut state = self.state();
        if !state.open {
            return Err(TransportError::NotOpen);
        }
        state.rx.clear();
        Ok(())
    }

    fn do_dispose(&self) {
        let mut state = self.state();
        state.open = false;
        state.disposed = true;
    }
}

impl Transport for MockLink {
    fn open(&mut self) -> Result<(), TransportError> {
        self.do_open()
    }
    fn close(&mut self) -> Result<(), TransportError> {
        self.do_close()
    }
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        match self.try_read(buf)? {
            Some(n) => Ok(n),
            None => {
                std::thread::sleep(timeout);
                Err(TransportError::TimedOut)
            }
        }
    }
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.do_write(bytes)
    }
    fn flush(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
    fn discard_input(&mut self) -> Result<(), TransportError> {
        self.do_discard()
    }
    fn dispose(&mut self) {
        self.do_dispose()
    }
    fn is_open(&self) -> bool {
        self.state().open
    }
    fn page_size(&self) -> Option<usize> {
        self.page_size
    }
    fn endpoint(&self) -> String {
        "mock".to_string()
    }
}

/// The same device behind the async capability set
#[derive(Clone)]
pub struct AsyncMockLink(pub MockLink);

#[async_trait]
impl AsyncTransport for AsyncMockLink {
    async fn open(&mut self) -> Result<(), TransportError> {
        self.0.do_open()
    }
    async fn close(&mut self) -> Result<(), TransportError> {
        self.0.do_close()
    }
    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        match self.0.try_read(buf)? {
            Some(n) => Ok(n),
            None => {
                tokio::time::sleep(timeout).await;
                Err(TransportError::TimedOut)
            }
        }
    }
    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.0.do_write(bytes)
    }
    async fn flush(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
    async fn discard_input(&mut self) -> Result<(), TransportError> {
        self.0.do_discard()
    }
    fn dispose(&mut self) {
        self.0.do_dispose()
    }
    fn is_open(&self) -> bool {
        self.0.state().open
    }
    fn page_size(&self) -> Option<usize> {
        self.0.page_size
    }
    fn endpoint(&self) -> String {
        "mock-async".to_string()
    }
}

/// Encoded BMS reply to `register`
pub fn bms_reply(register: u8, payload: &[u8]) -> Vec<u8> {
    BmsFraming.encode_reply(&Frame {
        family: Family::Bms,
        marker: BMS_START,
        code: CommandCode::Register(register),
        payload: payload.to_vec(),
        crc: [0, 0],
    })
}

/// Encoded inverter reply `(<text><crc>\r`
pub fn inverter_reply(text: &str) -> Vec<u8> {
    InverterFraming::new(false).encode_reply(&Frame {
        family: Family::Inverter,
        marker: INVERTER_START,
        code: CommandCode::Ascii(String::new()),
        payload: text.as_bytes().to_vec(),
        crc: [0, 0],
    })
}

/// 4S pack at 13.30 V / -2.00 A / 50 % with one NTC at 25.0 °C
pub fn basic_info_payload() -> Vec<u8> {
    vec![
        0x05, 0x32, 0xFF, 0x38, 0x03, 0xE8, 0x07, 0xD0, 0x00, 0x2A, 0x2E, 0x6F, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x21, 0x32, 0x03, 0x04, 0x01, 0x0B, 0xA5,
    ]
}

pub fn request_bytes(framing: &dyn FramingStrategy, command: &Command) -> Vec<u8> {
    framing.encode(command)
}

/// Route engine logs to the test harness; `RUST_LOG=solarlink_core=trace` shows wire bytes
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
