//! Unsigned LEB128 as used for string lengths in bytecode images.
//!
//! Decoding is bounded: it never reads past the end of the buffer and
//! rejects encodings that do not fit in 32 bits.

use super::FormatError;

/// The longest encoding of a u32
pub const MAX_ULEB128_LEN: usize = 5;

/// Decode a ULEB128 starting at `pos`, returning the value and the number of
/// bytes consumed.
pub fn read_uleb128(buf: &[u8], pos: usize) -> Result<(u32, usize), FormatError> {
    let mut value = 0u32;
    let mut shift = 0u32;

    for i in 0..MAX_ULEB128_LEN {
        let byte = *buf
            .get(pos + i)
            .ok_or(FormatError::UnterminatedLeb128(pos))?;

        let bits = (byte & 0x7f) as u32;
        if i == MAX_ULEB128_LEN - 1 && bits > 0x0f {
            return Err(FormatError::Leb128Overflow(pos));
        }
        value |= bits << shift;

        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        shift += 7;
    }

    Err(FormatError::Leb128Overflow(pos))
}

/// Append the ULEB128 encoding of `value` to `into`
pub fn write_uleb128(mut value: u32, into: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            into.push(byte);
            return;
        }
        into.push(byte | 0x80);
    }
}
