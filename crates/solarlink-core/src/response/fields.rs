//! Fixed-offset field extraction
//!
//! Every accessor checks bounds first and reports [`DecodeError::Truncated`]
//! instead of reading past the payload.

use byteorder::{BigEndian, ByteOrder};

use super::DecodeError;

/// Bounds-checked view over a response payload
#[derive(Debug, Clone, Copy)]
pub struct Fields<'a> {
    data: &'a [u8],
}

impl<'a> Fields<'a> {
    /// View over `data`
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// Fail unless the payload holds at least `needed` bytes
    pub fn require(&self, needed: usize) -> Result<(), DecodeError> {
        if self.data.len() < needed {
            return Err(DecodeError::Truncated {
                needed,
                actual: self.data.len(),
            });
        }
        Ok(())
    }

    fn slice(&self, offset: usize, len: usize) -> Result<&'a [u8], DecodeError> {
        self.require(offset + len)?;
        Ok(&self.data[offset..offset + len])
    }

    /// Single byte at `offset`
    pub fn u8(&self, offset: usize) -> Result<u8, DecodeError> {
        Ok(self.slice(offset, 1)?[0])
    }

    /// Big-endian word at `offset`
    pub fn u16_be(&self, offset: usize) -> Result<u16, DecodeError> {
        Ok(BigEndian::read_u16(self.slice(offset, 2)?))
    }

    /// Signed big-endian word at `offset`
    pub fn i16_be(&self, offset: usize) -> Result<i16, DecodeError> {
        Ok(BigEndian::read_i16(self.slice(offset, 2)?))
    }

    /// Fixed-length ASCII string; trailing NULs and spaces are dropped
    pub fn ascii(&self, offset: usize, len: usize) -> Result<String, DecodeError> {
        let bytes = self.slice(offset, len)?;
        Ok(String::from_utf8_lossy(bytes)
            .trim_end_matches(|c| c == '\0' || c == ' ')
            .to_string())
    }
}

/// Test a single bit of a flag word
pub fn bit(word: u32, index: u32) -> bool {
    (word >> index) & 1 != 0
}

/// Split an ASCII reply into whitespace-separated fields
pub fn text_fields(payload: &[u8]) -> Result<Vec<&str>, DecodeError> {
    let text = std::str::from_utf8(payload).map_err(|e| DecodeError::InvalidField {
        field: "payload",
        reason: e.to_string(),
    })?;
    Ok(text.split_whitespace().collect())
}

/// Parse a numeric ASCII field
pub fn parse_field<T: std::str::FromStr>(field: &'static str, text: &str) -> Result<T, DecodeError>
where
    T::Err: std::fmt::Display,
{
    text.parse().map_err(|e: T::Err| DecodeError::InvalidField {
        field,
        reason: format!("{text:?}: {e}"),
    })
}

/// Parse a string of `0`/`1` characters, first character first
pub fn bit_string(field: &'static str, text: &str) -> Result<Vec<bool>, DecodeError> {
    text.chars()
        .map(|c| match c {
            '0' => Ok(false),
            '1' => Ok(true),
            other => Err(DecodeError::InvalidField {
                field,
                reason: format!("unexpected flag character {other:?}"),
            }),
        })
        .collect()
}
