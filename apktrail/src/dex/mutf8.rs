//! Decoding of string data records.
//!
//! A record's length prefix counts UTF-16 code units while the payload is
//! modified UTF-8, so the two only agree for ASCII text.

use serde::{Deserialize, Serialize};

use super::FormatError;

/// How the declared length of a string record is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LengthMode {
    /// Walk modified UTF-8 sequences until the declared number of UTF-16
    /// units is consumed
    #[default]
    Utf16Units,
    /// Treat the declared length as a byte count and decode as plain UTF-8.
    /// Truncates any string containing multi-byte characters.
    Bytes,
}

/// Decode `units` characters of string data starting at `pos`.
pub fn decode_string(
    buf: &[u8],
    pos: usize,
    units: u32,
    mode: LengthMode,
) -> Result<String, FormatError> {
    match mode {
        LengthMode::Bytes => {
            let end = pos
                .checked_add(units as usize)
                .filter(|end| *end <= buf.len())
                .ok_or(FormatError::StringDataOutOfBounds(pos))?;
            Ok(String::from_utf8_lossy(&buf[pos..end]).into_owned())
        }
        LengthMode::Utf16Units => decode_mutf8(buf, pos, units),
    }
}

fn decode_mutf8(buf: &[u8], pos: usize, units: u32) -> Result<String, FormatError> {
    // Every unit takes at least one byte, so the remaining data bounds the
    // allocation no matter what the record declares
    let remaining = buf.len().saturating_sub(pos);
    let mut out: Vec<u16> = Vec::with_capacity((units as usize).min(remaining));
    let mut at = pos;

    let byte_at = |idx: usize| -> Result<u8, FormatError> {
        buf.get(idx)
            .copied()
            .ok_or(FormatError::StringDataOutOfBounds(pos))
    };

    for _ in 0..units {
        let lead = byte_at(at)?;
        let unit = match lead >> 4 {
            0x0..=0x7 => {
                at += 1;
                lead as u16
            }
            0xc | 0xd => {
                let b1 = byte_at(at + 1)?;
                if b1 & 0xc0 != 0x80 {
                    at += 1;
                    char::REPLACEMENT_CHARACTER as u16
                } else {
                    at += 2;
                    (((lead & 0x1f) as u16) << 6) | (b1 & 0x3f) as u16
                }
            }
            0xe => {
                let b1 = byte_at(at + 1)?;
                let b2 = byte_at(at + 2)?;
                if b1 & 0xc0 != 0x80 || b2 & 0xc0 != 0x80 {
                    at += 1;
                    char::REPLACEMENT_CHARACTER as u16
                } else {
                    at += 3;
                    (((lead & 0x0f) as u16) << 12)
                        | (((b1 & 0x3f) as u16) << 6)
                        | (b2 & 0x3f) as u16
                }
            }
            // Stray continuation bytes and 4 byte leads never start a unit in
            // well formed data
            _ => {
                at += 1;
                char::REPLACEMENT_CHARACTER as u16
            }
        };
        out.push(unit);
    }

    // Unpaired surrogates become U+FFFD
    Ok(String::from_utf16_lossy(&out))
}

/// Encode `s` as modified UTF-8, returning the bytes and the UTF-16 unit count
pub fn encode_mutf8(s: &str) -> (Vec<u8>, u32) {
    let mut bytes = Vec::with_capacity(s.len());
    let mut units = 0u32;
    for unit in s.encode_utf16() {
        units += 1;
        match unit {
            0x0001..=0x007f => bytes.push(unit as u8),
            0x0000 | 0x0080..=0x07ff => {
                bytes.push(0xc0 | (unit >> 6) as u8);
                bytes.push(0x80 | (unit & 0x3f) as u8);
            }
            _ => {
                bytes.push(0xe0 | (unit >> 12) as u8);
                bytes.push(0x80 | ((unit >> 6) & 0x3f) as u8);
                bytes.push(0x80 | (unit & 0x3f) as u8);
            }
        }
    }
    (bytes, units)
}

#[cfg(test)]
mod test {
    use super::*;
    use rstest::*;

    #[rstest]
    #[case("hello")]
    #[case("")]
    #[case("caf\u{e9}")]
    #[case("\u{4e2d}\u{6587} text")]
    #[case("emoji \u{1f600}!")]
    #[case("nul\u{0}inside")]
    fn test_utf16_units(#[case] text: &str) {
        let (bytes, units) = encode_mutf8(text);
        let got = decode_string(&bytes, 0, units, LengthMode::Utf16Units).unwrap();
        assert_eq!(got, text);
    }

    #[test]
    fn test_byte_count_truncates_multibyte() {
        let (bytes, units) = encode_mutf8("caf\u{e9}s");
        assert_eq!(units, 5);
        assert_eq!(bytes.len(), 6);
        // The last unit is cut off and the payload is otherwise valid UTF-8
        let got = decode_string(&bytes, 0, units, LengthMode::Bytes).unwrap();
        assert_eq!(got, "caf\u{e9}");
    }

    #[test]
    fn test_bytes_lossy() {
        let got = decode_string(&[b'a', 0xff, b'b'], 0, 3, LengthMode::Bytes).unwrap();
        assert_eq!(got, "a\u{fffd}b");
    }

    #[test]
    fn test_invalid_sequence_replaced() {
        // 0xc3 followed by an ASCII byte instead of a continuation
        let got = decode_string(&[0xc3, b'x'], 0, 2, LengthMode::Utf16Units).unwrap();
        assert_eq!(got, "\u{fffd}x");
    }

    #[rstest]
    #[case(LengthMode::Bytes)]
    #[case(LengthMode::Utf16Units)]
    fn test_out_of_bounds(#[case] mode: LengthMode) {
        assert_eq!(
            decode_string(b"abc", 1, 5, mode),
            Err(FormatError::StringDataOutOfBounds(1))
        );
    }

    #[test]
    fn test_truncated_sequence() {
        let (bytes, units) = encode_mutf8("\u{4e2d}");
        assert_eq!(
            decode_string(&bytes[..2], 0, units, LengthMode::Utf16Units),
            Err(FormatError::StringDataOutOfBounds(0))
        );
    }
}
