//! String pool extraction for Dalvik bytecode images.
//!
//! Only the header fields needed to locate the string table are parsed; no
//! other structure in the image is interpreted.

use thiserror::Error;

pub mod leb128;
pub use leb128::{read_uleb128, write_uleb128};

pub mod mutf8;
pub use mutf8::{decode_string, encode_mutf8, LengthMode};

/// Minimum size of a valid header
pub const HEADER_SIZE: usize = 0x70;

const STRING_IDS_SIZE_OFFSET: usize = 56;
const STRING_IDS_OFF_OFFSET: usize = 60;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("image is {0} bytes, shorter than the header")]
    TruncatedHeader(usize),

    #[error("string id {index} at {offset:#x} is outside the image")]
    StringIdOutOfBounds { index: u32, offset: u64 },

    #[error("string data at {0:#x} runs past the end of the image")]
    StringDataOutOfBounds(usize),

    #[error("uleb128 at {0:#x} is unterminated")]
    UnterminatedLeb128(usize),

    #[error("uleb128 at {0:#x} does not fit in 32 bits")]
    Leb128Overflow(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub string_ids_size: u32,
    pub string_ids_off: u32,
}

impl Header {
    pub fn parse(buf: &[u8]) -> Result<Self, FormatError> {
        if buf.len() < HEADER_SIZE {
            return Err(FormatError::TruncatedHeader(buf.len()));
        }
        Ok(Self {
            string_ids_size: read_u32_le(buf, STRING_IDS_SIZE_OFFSET),
            string_ids_off: read_u32_le(buf, STRING_IDS_OFF_OFFSET),
        })
    }
}

/// Caller guarantees `at + 4 <= buf.len()`
#[inline]
fn read_u32_le(buf: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(raw)
}

/// A single bytecode image with its parsed header
#[derive(Debug, Clone)]
pub struct BytecodeImage {
    data: Vec<u8>,
    header: Header,
}

impl BytecodeImage {
    pub fn parse(data: Vec<u8>) -> Result<Self, FormatError> {
        let header = Header::parse(&data)?;
        Ok(Self { data, header })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Offset of the string data record for string id `index`
    pub fn string_data_offset(&self, index: u32) -> Result<usize, FormatError> {
        let at = self.header.string_ids_off as u64 + 4 * index as u64;
        let oob = FormatError::StringIdOutOfBounds { index, offset: at };
        if at + 4 > self.data.len() as u64 {
            return Err(oob);
        }
        Ok(read_u32_le(&self.data, at as usize) as usize)
    }

    /// Decode the string record at the given data offset
    pub fn string_at(&self, offset: usize, mode: LengthMode) -> Result<String, FormatError> {
        let (units, consumed) = read_uleb128(&self.data, offset)?;
        decode_string(&self.data, offset + consumed, units, mode)
    }

    /// Decode every entry in the string table, in table order
    pub fn strings(&self, mode: LengthMode) -> Result<Vec<String>, FormatError> {
        let count = self.header.string_ids_size;
        // Every id needs at least 4 bytes in the table, don't trust the
        // header for the allocation
        let mut out = Vec::with_capacity((count as usize).min(self.data.len() / 4));
        for index in 0..count {
            let offset = self.string_data_offset(index)?;
            out.push(self.string_at(offset, mode)?);
        }
        log::trace!("decoded {} strings from {} byte image", out.len(), self.len());
        Ok(out)
    }
}

/// Decode the string pool of a raw image with the default length mode
pub fn decode(buf: Vec<u8>) -> Result<Vec<String>, FormatError> {
    decode_with(buf, LengthMode::default())
}

pub fn decode_with(buf: Vec<u8>, mode: LengthMode) -> Result<Vec<String>, FormatError> {
    BytecodeImage::parse(buf)?.strings(mode)
}
