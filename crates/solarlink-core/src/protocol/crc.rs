//! Checksum algorithms
//!
//! Two algorithms are in use:
//! - [`SumChecksum`]: the additive 16-bit checksum of the BMS register protocol.
//!   `crc = seed + sum(payload) + len(payload)`, one's-complemented and incremented,
//!   written big-endian.
//! - [`CcittChecksum`]: CRC-16/CCITT (XMODEM polynomial) computed nibble-wise, with
//!   each output byte bumped by one when it would collide with `0x0D`, `0x0A` or `0x28`.

/// A pluggable two-byte checksum
pub trait Checksum: Send + Sync {
    /// Compute the checksum of `payload` starting from `seed`
    fn compute(&self, payload: &[u8], seed: u16) -> [u8; 2];

    /// Check `claimed` against the checksum of `payload` with the given seed
    fn validate_seeded(&self, payload: &[u8], seed: u16, claimed: [u8; 2]) -> bool {
        self.compute(payload, seed) == claimed
    }

    /// Check `claimed` against the checksum of `payload` (seed 0)
    fn validate(&self, payload: &[u8], claimed: [u8; 2]) -> bool {
        self.validate_seeded(payload, 0, claimed)
    }
}

/// Additive checksum used by the BMS family
#[derive(Debug, Clone, Copy, Default)]
pub struct SumChecksum;

impl Checksum for SumChecksum {
    fn compute(&self, payload: &[u8], seed: u16) -> [u8; 2] {
        let sum = payload
            .iter()
            .fold(seed, |acc, &b| acc.wrapping_add(b as u16))
            .wrapping_add(payload.len() as u16);
        ((sum ^ 0xFFFF).wrapping_add(1)).to_be_bytes()
    }
}

/// CRC-16/CCITT nibble table (polynomial 0x1021)
const CCITT_NIBBLE_TABLE: [u16; 16] = [
    0x0000, 0x1021, 0x2042, 0x3063, 0x4084, 0x50a5, 0x60c6, 0x70e7, 0x8108, 0x9129, 0xa14a,
    0xb16b, 0xc18c, 0xd1ad, 0xe1ce, 0xf1ef,
];

/// Byte values the inverter treats as framing; a CRC byte never takes one of them
const RESERVED_CRC_BYTES: [u8; 3] = [0x0D, 0x0A, 0x28];

/// CRC-16/CCITT checksum used by the inverter family
#[derive(Debug, Clone, Copy, Default)]
pub struct CcittChecksum;

impl CcittChecksum {
    /// Raw CRC before the reserved-byte bump
    pub fn raw(payload: &[u8], seed: u16) -> u16 {
        payload.iter().fold(seed, |crc, &b| {
            let crc = (crc << 4) ^ CCITT_NIBBLE_TABLE[((crc >> 12) ^ (b as u16 >> 4)) as usize];
            (crc << 4) ^ CCITT_NIBBLE_TABLE[((crc >> 12) ^ (b as u16 & 0x0F)) as usize]
        })
    }
}

fn bump_reserved(byte: u8) -> u8 {
    if RESERVED_CRC_BYTES.contains(&byte) {
        byte + 1
    } else {
        byte
    }
}

impl Checksum for CcittChecksum {
    fn compute(&self, payload: &[u8], seed: u16) -> [u8; 2] {
        let [hi, lo] = Self::raw(payload, seed).to_be_bytes();
        [bump_reserved(hi), bump_reserved(lo)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sum_checksum_read_request() {
        // DD A5 03 00 FF FD 77
        assert_eq!(SumChecksum.compute(&[], 0x03), [0xFF, 0xFD]);
        assert_eq!(SumChecksum.compute(&[], 0x04), [0xFF, 0xFC]);
    }

    #[test]
    fn test_sum_checksum_with_payload() {
        // MOS control: E1 02 00 02 -> FF 1B
        assert_eq!(SumChecksum.compute(&[0x00, 0x02], 0xE1), [0xFF, 0x1B]);
    }

    #[test]
    fn test_ccitt_qpi() {
        assert_eq!(CcittChecksum.compute(b"QPI", 0), [0xBE, 0xAC]);
    }

    #[test]
    fn test_ccitt_qpigs() {
        assert_eq!(CcittChecksum.compute(b"QPIGS", 0), [0xB7, 0xA9]);
    }

    #[test]
    fn test_ccitt_matches_xmodem_reference() {
        let xmodem = crc::Crc::<u16>::new(&crc::CRC_16_XMODEM);
        for input in [&b"QMOD"[..], b"QPIWS", b"QID", b"(230.0 50.0", b"123456789"] {
            assert_eq!(CcittChecksum::raw(input, 0), xmodem.checksum(input));
        }
    }

    #[test]
    fn test_ccitt_never_emits_reserved_bytes() {
        for a in 0u8..=255 {
            for b in [0u8, 0x0D, 0x28, 0x7F, 0xFF] {
                let crc = CcittChecksum.compute(&[a, b], 0);
                for byte in crc {
                    assert!(!RESERVED_CRC_BYTES.contains(&byte), "{:02x?} from {a} {b}", crc);
                }
            }
        }
    }

    #[test]
    fn test_validate_roundtrip_both_engines() {
        let samples: [&[u8]; 4] = [&[], &[0x00], b"QPIGS", &[0xFF; 40]];
        for payload in samples {
            for seed in [0u16, 0x03, 0x05, 0xE1] {
                let sum = SumChecksum.compute(payload, seed);
                assert!(SumChecksum.validate_seeded(payload, seed, sum));
                let ccitt = CcittChecksum.compute(payload, seed);
                assert!(CcittChecksum.validate_seeded(payload, seed, ccitt));
            }
            assert!(SumChecksum.validate(payload, SumChecksum.compute(payload, 0)));
        }
    }

    #[test]
    fn test_validate_rejects_corruption() {
        let crc = SumChecksum.compute(&[1, 2, 3], 0);
        assert!(!SumChecksum.validate(&[1, 2, 4], crc));
    }
}
