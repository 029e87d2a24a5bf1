use std::io::{Cursor, Write};
use std::process::ExitStatus;

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

#[cfg(feature = "sql")]
use crate::db::models::ApkRecord;
use crate::dex::{encode_mutf8, write_uleb128, HEADER_SIZE};
use crate::download::SourceResponse;

/// Builds minimal bytecode images: a zeroed header carrying only the string
/// table location, the id table, then one record per string.
#[derive(Default)]
pub struct DexBuilder {
    strings: Vec<String>,
}

impl DexBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn strings<I, S>(mut self, strings: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.strings.extend(strings.into_iter().map(Into::into));
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let count = self.strings.len();
        let ids_off = HEADER_SIZE;
        let mut out = vec![0u8; HEADER_SIZE + 4 * count];
        out[0..8].copy_from_slice(b"dex\n035\0");
        out[56..60].copy_from_slice(&(count as u32).to_le_bytes());
        out[60..64].copy_from_slice(&(ids_off as u32).to_le_bytes());

        for (i, s) in self.strings.iter().enumerate() {
            let data_off = out.len() as u32;
            let slot = ids_off + 4 * i;
            out[slot..slot + 4].copy_from_slice(&data_off.to_le_bytes());

            let (bytes, units) = encode_mutf8(s);
            write_uleb128(units, &mut out);
            out.extend_from_slice(&bytes);
            out.push(0);
        }
        out
    }
}

/// An in-memory zip with every entry stored uncompressed, in the given order
pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let opts = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    for (name, data) in entries {
        zip.start_file(*name, opts).expect("start zip entry");
        zip.write_all(data).expect("write zip entry");
    }
    zip.finish().expect("finish zip").into_inner()
}

/// Flip a byte inside a stored entry so its CRC no longer matches
pub fn corrupt_stored_entry(raw: &mut [u8], payload: &[u8]) {
    let at = raw
        .windows(payload.len())
        .position(|w| w == payload)
        .expect("payload not stored verbatim");
    raw[at + payload.len() / 2] ^= 0xff;
}

pub fn response(status: u16, len: usize) -> SourceResponse {
    SourceResponse {
        status,
        body: Box::new(Cursor::new(vec![b'A'; len])),
    }
}

#[cfg(unix)]
pub fn exit_status(code: i32) -> ExitStatus {
    use std::os::unix::process::ExitStatusExt;
    ExitStatus::from_raw(code << 8)
}

#[cfg(feature = "sql")]
pub fn apk_record(n: u64, pkg: &str, vercode: &str, date: &str) -> ApkRecord {
    ApkRecord {
        sha256: format!("{:064x}", n),
        pkg_name: pkg.into(),
        vercode: vercode.into(),
        vt_scan_date: date.into(),
    }
}
