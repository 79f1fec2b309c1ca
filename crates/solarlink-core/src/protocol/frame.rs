//! Frame encoding/decoding
//!
//! BMS register frames (length-prefixed):
//! - Request: `DD A5|5A <cmd> <len> <payload…> <crcHi> <crcLo> 77`
//! - Reply:   `DD <cmd> <lenHi> <lenLo> <payload…> <crcHi> <crcLo> [77]`
//!
//! Inverter ASCII frames (terminator-delimited):
//! - Request: `[00] <ASCII query> <crcHi> <crcLo> 0D` (`00` report id on HID only)
//! - Reply:   `( <ASCII fields> <crcHi> <crcLo> 0D`

use byteorder::{BigEndian, ByteOrder};

use super::commands::{Command, CommandCode, Family};
use super::crc::{CcittChecksum, Checksum, SumChecksum};
use super::{FrameError, MAX_FRAME_SIZE};

/// BMS start-of-frame marker
pub const BMS_START: u8 = 0xDD;
/// BMS request status byte for reads
pub const BMS_READ: u8 = 0xA5;
/// BMS request status byte for writes
pub const BMS_WRITE: u8 = 0x5A;
/// BMS end-of-frame marker
pub const BMS_END: u8 = 0x77;
/// Inverter reply marker `(`
pub const INVERTER_START: u8 = b'(';
/// Inverter end-of-frame terminator (carriage return)
pub const INVERTER_END: u8 = 0x0D;
/// HID report id prefixed to inverter requests
pub const HID_REPORT_ID: u8 = 0x00;

/// Replies of this length or shorter cannot be a BMS frame
const BMS_MIN_REPLY: usize = 7;
/// `(` + CRC + terminator
const INVERTER_MIN_REPLY: usize = 4;

/// A decoded, CRC-checked reply frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Family whose framing produced this frame
    pub family: Family,
    /// Leading marker byte
    pub marker: u8,
    /// Command the frame answers
    pub code: CommandCode,
    /// Payload bytes (for inverter replies: the text between `(` and the CRC)
    pub payload: Vec<u8>,
    /// CRC bytes as received
    pub crc: [u8; 2],
}

/// How the receiver decides a reply is complete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveRule {
    /// A header declares the payload length
    LengthPrefixed {
        /// Expected first byte; anything else completes the frame early so it can be rejected
        marker: u8,
        /// Offset of the big-endian u16 payload length
        length_offset: usize,
        /// Bytes around the payload: header plus CRC
        overhead: usize,
        /// Never complete below this many bytes, whatever the declared length
        min_len: usize,
    },
    /// The frame ends at the first occurrence of this byte
    Terminator(u8),
    /// The frame ends when a read times out with nothing new
    Quiet,
}

impl ReceiveRule {
    /// Whether `buf` holds a complete frame under this rule
    pub fn is_complete(&self, buf: &[u8]) -> bool {
        match *self {
            ReceiveRule::LengthPrefixed {
                marker,
                length_offset,
                overhead,
                min_len,
            } => {
                if buf.is_empty() {
                    return false;
                }
                if buf[0] != marker {
                    return true;
                }
                if buf.len() < length_offset + 2 {
                    return false;
                }
                let declared = BigEndian::read_u16(&buf[length_offset..length_offset + 2]) as usize;
                declared > MAX_FRAME_SIZE || buf.len() >= (overhead + declared).max(min_len)
            }
            ReceiveRule::Terminator(byte) => buf.contains(&byte),
            ReceiveRule::Quiet => false,
        }
    }
}

/// Wire format of one device family
pub trait FramingStrategy: Send + Sync {
    /// Family this framing speaks
    fn family(&self) -> Family;

    /// Encode a request
    fn encode(&self, command: &Command) -> Vec<u8>;

    /// Decode and validate a reply to `request`
    fn decode(&self, raw: &[u8], request: &Command) -> Result<Frame, FrameError>;

    /// Parse a request frame back into a command (device side)
    fn decode_request(&self, raw: &[u8]) -> Result<Command, FrameError>;

    /// Encode a reply frame (device side)
    fn encode_reply(&self, frame: &Frame) -> Vec<u8>;

    /// Completion rule for replies
    fn receive_rule(&self) -> ReceiveRule;

    /// Short frame sent after a transport reopen to bring the device back to a known state
    fn wake_frame(&self) -> Vec<u8>;
}

impl<F: FramingStrategy + ?Sized> FramingStrategy for Box<F> {
    fn family(&self) -> Family {
        (**self).family()
    }
    fn encode(&self, command: &Command) -> Vec<u8> {
        (**self).encode(command)
    }
    fn decode(&self, raw: &[u8], request: &Command) -> Result<Frame, FrameError> {
        (**self).decode(raw, request)
    }
    fn decode_request(&self, raw: &[u8]) -> Result<Command, FrameError> {
        (**self).decode_request(raw)
    }
    fn encode_reply(&self, frame: &Frame) -> Vec<u8> {
        (**self).encode_reply(frame)
    }
    fn receive_rule(&self) -> ReceiveRule {
        (**self).receive_rule()
    }
    fn wake_frame(&self) -> Vec<u8> {
        (**self).wake_frame()
    }
}

/// Select the framing for a family; `hid` adds the inverter report id
pub fn framing_for(family: Family, hid: bool) -> Box<dyn FramingStrategy> {
    match family {
        Family::Bms => Box::new(BmsFraming),
        Family::Inverter => Box::new(InverterFraming::new(hid)),
    }
}

/// Length-prefixed framing of the BMS register protocol
#[derive(Debug, Clone, Copy, Default)]
pub struct BmsFraming;

impl BmsFraming {
    fn register(code: &CommandCode) -> Option<u8> {
        match code {
            CommandCode::Register(reg) => Some(*reg),
            CommandCode::Ascii(_) => None,
        }
    }
}

impl FramingStrategy for BmsFraming {
    fn family(&self) -> Family {
        Family::Bms
    }

    fn encode(&self, command: &Command) -> Vec<u8> {
        let register = Self::register(command.code()).unwrap_or_default();
        let payload = command.payload();
        let status = if payload.is_empty() { BMS_READ } else { BMS_WRITE };
        let mut bytes = Vec::with_capacity(payload.len() + 7);
        bytes.push(BMS_START);
        bytes.push(status);
        bytes.push(register);
        bytes.push(payload.len() as u8);
        bytes.extend_from_slice(payload);
        bytes.extend_from_slice(&SumChecksum.compute(payload, register as u16));
        bytes.push(BMS_END);
        bytes
    }

    fn decode(&self, raw: &[u8], request: &Command) -> Result<Frame, FrameError> {
        if raw.len() < BMS_MIN_REPLY {
            return Err(FrameError::TooShort {
                len: raw.len(),
                min: BMS_MIN_REPLY,
            });
        }
        if raw[0] != BMS_START {
            return Err(FrameError::MarkerMismatch {
                expected: BMS_START,
                actual: raw[0],
            });
        }
        let echoed = CommandCode::Register(raw[1]);
        if Self::register(request.code()) != Some(raw[1]) {
            return Err(FrameError::CommandMismatch {
                expected: request.code().clone(),
                actual: echoed,
            });
        }

        let declared = BigEndian::read_u16(&raw[2..4]) as usize;
        let end = 4 + declared;
        if end + 2 > raw.len() {
            return Err(FrameError::LengthOverrun {
                declared,
                available: raw.len().saturating_sub(6),
            });
        }

        let payload = &raw[4..end];
        let crc = [raw[end], raw[end + 1]];
        let expected = SumChecksum.compute(payload, 0);
        if expected != crc {
            return Err(FrameError::CrcMismatch {
                expected,
                actual: crc,
            });
        }

        Ok(Frame {
            family: Family::Bms,
            marker: raw[0],
            code: echoed,
            payload: payload.to_vec(),
            crc,
        })
    }

    fn decode_request(&self, raw: &[u8]) -> Result<Command, FrameError> {
        if raw.len() < BMS_MIN_REPLY {
            return Err(FrameError::TooShort {
                len: raw.len(),
                min: BMS_MIN_REPLY,
            });
        }
        if raw[0] != BMS_START {
            return Err(FrameError::MarkerMismatch {
                expected: BMS_START,
                actual: raw[0],
            });
        }
        if raw[1] != BMS_READ && raw[1] != BMS_WRITE {
            return Err(FrameError::MarkerMismatch {
                expected: BMS_READ,
                actual: raw[1],
            });
        }
        let register = raw[2];
        let declared = raw[3] as usize;
        let end = 4 + declared;
        if end + 2 > raw.len() {
            return Err(FrameError::LengthOverrun {
                declared,
                available: raw.len().saturating_sub(7),
            });
        }
        let payload = &raw[4..end];
        let crc = [raw[end], raw[end + 1]];
        let expected = SumChecksum.compute(payload, register as u16);
        if expected != crc {
            return Err(FrameError::CrcMismatch {
                expected,
                actual: crc,
            });
        }

        Ok(if payload.is_empty() {
            Command::read_register(register)
        } else {
            Command::register_write(register, payload.to_vec())
        })
    }

    fn encode_reply(&self, frame: &Frame) -> Vec<u8> {
        let register = Self::register(&frame.code).unwrap_or_default();
        let mut bytes = Vec::with_capacity(frame.payload.len() + 7);
        bytes.push(BMS_START);
        bytes.push(register);
        bytes.extend_from_slice(&(frame.payload.len() as u16).to_be_bytes());
        bytes.extend_from_slice(&frame.payload);
        bytes.extend_from_slice(&SumChecksum.compute(&frame.payload, 0));
        bytes.push(BMS_END);
        bytes
    }

    fn receive_rule(&self) -> ReceiveRule {
        ReceiveRule::LengthPrefixed {
            marker: BMS_START,
            length_offset: 2,
            overhead: 6,
            min_len: BMS_MIN_REPLY,
        }
    }

    fn wake_frame(&self) -> Vec<u8> {
        self.encode(&Command::read_register(
            super::commands::BmsRegister::BasicInfo.code(),
        ))
    }
}

/// Terminator-delimited ASCII framing of the inverter protocol
#[derive(Debug, Clone, Copy, Default)]
pub struct InverterFraming {
    hid_report_id: bool,
}

impl InverterFraming {
    /// `hid_report_id` prefixes requests with the HID report id byte
    pub fn new(hid_report_id: bool) -> Self {
        Self { hid_report_id }
    }

    /// Skip HID report ids and zero padding in front of a frame
    fn skip_padding(raw: &[u8]) -> &[u8] {
        let start = raw.iter().position(|&b| b != 0x00).unwrap_or(raw.len());
        &raw[start..]
    }

    /// Split `body + crc + 0D` into body and crc
    fn split_terminated(data: &[u8], min: usize) -> Result<(&[u8], [u8; 2]), FrameError> {
        let end = data
            .iter()
            .position(|&b| b == INVERTER_END)
            .ok_or(FrameError::Unterminated {
                terminator: INVERTER_END,
                len: data.len(),
            })?;
        if end + 1 < min {
            return Err(FrameError::TooShort { len: end + 1, min });
        }
        let body = &data[..end - 2];
        let crc = [data[end - 2], data[end - 1]];
        let expected = CcittChecksum.compute(body, 0);
        if expected != crc {
            return Err(FrameError::CrcMismatch {
                expected,
                actual: crc,
            });
        }
        Ok((body, crc))
    }
}

impl FramingStrategy for InverterFraming {
    fn family(&self) -> Family {
        Family::Inverter
    }

    fn encode(&self, command: &Command) -> Vec<u8> {
        let text = command.payload();
        let mut bytes = Vec::with_capacity(text.len() + 4);
        if self.hid_report_id {
            bytes.push(HID_REPORT_ID);
        }
        bytes.extend_from_slice(text);
        bytes.extend_from_slice(&CcittChecksum.compute(text, 0));
        bytes.push(INVERTER_END);
        bytes
    }

    fn decode(&self, raw: &[u8], request: &Command) -> Result<Frame, FrameError> {
        let data = Self::skip_padding(raw);
        if data.len() < INVERTER_MIN_REPLY {
            return Err(FrameError::TooShort {
                len: data.len(),
                min: INVERTER_MIN_REPLY,
            });
        }
        if data[0] != INVERTER_START {
            return Err(FrameError::MarkerMismatch {
                expected: INVERTER_START,
                actual: data[0],
            });
        }
        let (body, crc) = Self::split_terminated(data, INVERTER_MIN_REPLY)?;

        Ok(Frame {
            family: Family::Inverter,
            marker: INVERTER_START,
            code: request.code().clone(),
            payload: body[1..].to_vec(),
            crc,
        })
    }

    fn decode_request(&self, raw: &[u8]) -> Result<Command, FrameError> {
        let data = Self::skip_padding(raw);
        if data.len() < INVERTER_MIN_REPLY {
            return Err(FrameError::TooShort {
                len: data.len(),
                min: INVERTER_MIN_REPLY,
            });
        }
        let (body, _) = Self::split_terminated(data, INVERTER_MIN_REPLY)?;
        Ok(Command::ascii(String::from_utf8_lossy(body)))
    }

    fn encode_reply(&self, frame: &Frame) -> Vec<u8> {
        let mut body = Vec::with_capacity(frame.payload.len() + 1);
        body.push(INVERTER_START);
        body.extend_from_slice(&frame.payload);
        let crc = CcittChecksum.compute(&body, 0);
        body.extend_from_slice(&crc);
        body.push(INVERTER_END);
        body
    }

    fn receive_rule(&self) -> ReceiveRule {
        ReceiveRule::Terminator(INVERTER_END)
    }

    fn wake_frame(&self) -> Vec<u8> {
        if self.hid_report_id {
            vec![HID_REPORT_ID, INVERTER_END]
        } else {
            vec![INVERTER_END]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::commands::{BmsRegister, InverterQuery};
    use pretty_assertions::assert_eq;

    fn bms_reply(register: u8, payload: &[u8]) -> Vec<u8> {
        BmsFraming.encode_reply(&Frame {
            family: Family::Bms,
            marker: BMS_START,
            code: CommandCode::Register(register),
            payload: payload.to_vec(),
            crc: [0, 0],
        })
    }

    #[test]
    fn test_bms_read_request_bytes() {
        let bytes = BmsFraming.encode(&BmsRegister::BasicInfo.into());
        assert_eq!(bytes, vec![0xDD, 0xA5, 0x03, 0x00, 0xFF, 0xFD, 0x77]);
    }

    #[test]
    fn test_qpi_over_hid() {
        let framing = InverterFraming::new(true);
        let bytes = framing.encode(&InverterQuery::ProtocolId.into());
        assert_eq!(bytes, vec![0x00, 0x51, 0x50, 0x49, 0xBE, 0xAC, 0x0D]);
    }

    #[test]
    fn test_qpi_over_serial_has_no_report_id() {
        let bytes = InverterFraming::new(false).encode(&InverterQuery::ProtocolId.into());
        assert_eq!(bytes, vec![0x51, 0x50, 0x49, 0xBE, 0xAC, 0x0D]);
    }

    #[test]
    fn test_bms_reply_decode() {
        let raw = bms_reply(0x04, &[0x0E, 0x2E, 0x0E, 0x30]);
        let frame = BmsFraming
            .decode(&raw, &BmsRegister::CellVoltages.into())
            .expect("valid frame");
        assert_eq!(frame.payload, vec![0x0E, 0x2E, 0x0E, 0x30]);
        assert_eq!(frame.code, CommandCode::Register(0x04));
    }

    #[test]
    fn test_bms_reply_without_tail_is_accepted() {
        let mut raw = bms_reply(0x05, b"JBD-SP04S034");
        raw.pop();
        assert!(BmsFraming
            .decode(&raw, &BmsRegister::HardwareVersion.into())
            .is_ok());
    }

    #[test]
    fn test_bms_marker_mismatch() {
        let mut raw = bms_reply(0x03, &[0; 23]);
        raw[0] = 0xDE;
        let err = BmsFraming
            .decode(&raw, &BmsRegister::BasicInfo.into())
            .unwrap_err();
        assert_eq!(
            err,
            FrameError::MarkerMismatch {
                expected: 0xDD,
                actual: 0xDE
            }
        );
    }

    #[test]
    fn test_bms_too_short_before_crc() {
        // Six bytes with a bogus CRC: length is reported, not the CRC
        let raw = [0xDD, 0x03, 0x00, 0x00, 0x12, 0x34];
        let err = BmsFraming
            .decode(&raw, &BmsRegister::BasicInfo.into())
            .unwrap_err();
        assert_eq!(err, FrameError::TooShort { len: 6, min: 7 });
    }

    #[test]
    fn test_bms_command_mismatch() {
        let raw = bms_reply(0x04, &[0x0E, 0x2E]);
        let err = BmsFraming
            .decode(&raw, &BmsRegister::BasicInfo.into())
            .unwrap_err();
        assert!(matches!(err, FrameError::CommandMismatch { .. }));
    }

    #[test]
    fn test_bms_length_overrun() {
        let mut raw = bms_reply(0x04, &[0x0E, 0x2E]);
        raw[3] = 0x40;
        let err = BmsFraming
            .decode(&raw, &BmsRegister::CellVoltages.into())
            .unwrap_err();
        assert!(matches!(err, FrameError::LengthOverrun { declared: 0x40, .. }));
    }

    #[test]
    fn test_bms_crc_mismatch() {
        let mut raw = bms_reply(0x04, &[0x0E, 0x2E]);
        raw[4] ^= 0xFF;
        let err = BmsFraming
            .decode(&raw, &BmsRegister::CellVoltages.into())
            .unwrap_err();
        assert!(matches!(err, FrameError::CrcMismatch { .. }));
    }

    #[test]
    fn test_request_roundtrip() {
        let commands: Vec<Command> = vec![
            BmsRegister::BasicInfo.into(),
            BmsRegister::HardwareVersion.into(),
            crate::protocol::commands::mos_control(true, false),
            Command::write_register(0x10, vec![0xAB; 255]).unwrap(),
        ];
        for cmd in commands {
            assert_eq!(BmsFraming.decode_request(&BmsFraming.encode(&cmd)).unwrap(), cmd);
        }
        for hid in [false, true] {
            let framing = InverterFraming::new(hid);
            for query in InverterQuery::ALL {
                let cmd: Command = query.into();
                assert_eq!(framing.decode_request(&framing.encode(&cmd)).unwrap(), cmd);
            }
        }
    }

    #[test]
    fn test_inverter_reply_roundtrip() {
        let framing = InverterFraming::new(false);
        let request: Command = InverterQuery::DeviceMode.into();
        let frame = Frame {
            family: Family::Inverter,
            marker: INVERTER_START,
            code: request.code().clone(),
            payload: b"B".to_vec(),
            crc: [0, 0],
        };
        let raw = framing.encode_reply(&frame);
        let decoded = framing.decode(&raw, &request).unwrap();
        assert_eq!(decoded.payload, b"B".to_vec());
        assert_eq!(decoded.crc, [raw[2], raw[3]]);
    }

    #[test]
    fn test_inverter_hid_padding_skipped() {
        let framing = InverterFraming::new(true);
        let request: Command = InverterQuery::ProtocolId.into();
        let mut raw = vec![0x00];
        raw.extend(framing.encode_reply(&Frame {
            family: Family::Inverter,
            marker: INVERTER_START,
            code: request.code().clone(),
            payload: b"PI30".to_vec(),
            crc: [0, 0],
        }));
        raw.extend([0x00; 6]);
        assert_eq!(framing.decode(&raw, &request).unwrap().payload, b"PI30".to_vec());
    }

    #[test]
    fn test_inverter_unterminated() {
        let err = InverterFraming::new(false)
            .decode(b"(PI30", &InverterQuery::ProtocolId.into())
            .unwrap_err();
        assert!(matches!(err, FrameError::Unterminated { .. }));
    }

    #[test]
    fn test_receive_rules() {
        let rule = BmsFraming.receive_rule();
        assert!(!rule.is_complete(&[0xDD, 0x03]));
        assert!(!rule.is_complete(&[0xDD, 0x03, 0x00, 0x02, 0x01]));
        assert!(rule.is_complete(&[0xDD, 0x03, 0x00, 0x02, 0x01, 0x02, 0xFF, 0xFB]));
        // Garbage completes early so the decoder can reject it
        assert!(rule.is_complete(&[0x42]));
        // Empty payload: wait for the tail byte the decoder requires
        assert!(!rule.is_complete(&[0xDD, 0xE1, 0x00, 0x00, 0x00, 0x00]));
        assert!(rule.is_complete(&[0xDD, 0xE1, 0x00, 0x00, 0x00, 0x00, 0x77]));

        let rule = InverterFraming::new(false).receive_rule();
        assert!(!rule.is_complete(b"(PI3"));
        assert!(rule.is_complete(b"(PI30\x9a\x0b\r"));
        assert!(!ReceiveRule::Quiet.is_complete(b"anything"));
    }
}
