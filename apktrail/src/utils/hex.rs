pub const HEX_BYTES_LOWER: &[u8; 16] = &[
    b'0', b'1', b'2', b'3', b'4', b'5', b'6', b'7', b'8', b'9', b'a', b'b', b'c', b'd', b'e', b'f',
];

pub fn bytes_to_hex(bytes: &[u8]) -> String {
    let mut into = String::with_capacity(bytes.len() * 2);

    for b in bytes {
        let high = (b & 0xF0) >> 4;
        let low = b & 0xF;
        into.push(HEX_BYTES_LOWER[high as usize] as char);
        into.push(HEX_BYTES_LOWER[low as usize] as char);
    }
    into
}

/// SHA-256 content hashes are exactly 64 hex digits, either case
pub fn is_sha256_hex(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}
