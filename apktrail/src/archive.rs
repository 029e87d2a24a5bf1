use std::fs::File;
use std::io::{self, Read, Seek};
use std::path::{Path, PathBuf};

use thiserror::Error;
use walkdir::WalkDir;
use zip::result::ZipError;
use zip::ZipArchive;

use crate::utils::{ensure_dir_exists, move_file, path_has_ext};

pub const DEX_SUFFIX: &str = ".dex";

/// Upper bound on the buffer reserved up front for an entry. Larger entries
/// still read fine, they just grow as data actually arrives.
const MAX_PREALLOC: u64 = 16 << 20;

/// Buffer size to reserve for an entry whose header claims `declared` bytes
fn initial_capacity(declared: u64) -> usize {
    declared.min(MAX_PREALLOC) as usize
}

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("{0}")]
    IO(io::Error),
    #[error("corrupt archive: {0}")]
    Corrupt(String),
    #[error("failed to read entry {name}: {source}")]
    Entry { name: String, source: io::Error },
}

impl From<io::Error> for ArchiveError {
    fn from(err: io::Error) -> Self {
        Self::IO(err)
    }
}

impl From<ZipError> for ArchiveError {
    fn from(err: ZipError) -> Self {
        match err {
            ZipError::Io(io) => Self::IO(io),
            e => Self::Corrupt(e.to_string()),
        }
    }
}

pub type ArchiveResult<T> = Result<T, ArchiveError>;

/// A decompressed bytecode image and the entry it came from
#[derive(Debug, Clone)]
pub struct DexEntry {
    pub name: String,
    pub data: Vec<u8>,
}

/// Lazily yields the `.dex` entries of an archive in central directory order.
///
/// Reopen the archive to iterate again.
pub struct DexEntries<R> {
    archive: ZipArchive<R>,
    next: usize,
}

impl<R: Read + Seek> DexEntries<R> {
    pub fn new(reader: R) -> ArchiveResult<Self> {
        let archive = ZipArchive::new(reader)?;
        Ok(Self { archive, next: 0 })
    }

    /// Total entries in the archive, including non bytecode ones
    pub fn total_entries(&self) -> usize {
        self.archive.len()
    }

    fn read_next(&mut self) -> Option<ArchiveResult<DexEntry>> {
        while self.next < self.archive.len() {
            let idx = self.next;
            self.next += 1;

            let mut file = match self.archive.by_index(idx) {
                Ok(v) => v,
                Err(e) => return Some(Err(e.into())),
            };
            if !file.name().ends_with(DEX_SUFFIX) {
                log::trace!("ignoring file: {}", file.name());
                continue;
            }
            let name = file.name().to_string();
            let mut data = Vec::with_capacity(initial_capacity(file.size()));
            // Checksums are verified when the entry is read to the end
            if let Err(source) = file.read_to_end(&mut data) {
                return Some(Err(ArchiveError::Entry { name, source }));
            }
            return Some(Ok(DexEntry { name, data }));
        }
        None
    }
}

impl<R: Read + Seek> Iterator for DexEntries<R> {
    type Item = ArchiveResult<DexEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_next()
    }
}

pub fn open_archive(path: &Path) -> ArchiveResult<DexEntries<File>> {
    let opened = File::open(path)?;
    DexEntries::new(opened)
}

/// Read every bytecode image in the archive, failing on the first bad entry
pub fn read_dex_images(path: &Path) -> ArchiveResult<Vec<DexEntry>> {
    open_archive(path)?.collect()
}

/// Fully read every entry of the archive so that structural and checksum
/// problems anywhere in it are reported
pub fn check_archive(path: &Path) -> ArchiveResult<()> {
    let opened = File::open(path)?;
    let mut archive = ZipArchive::new(opened)?;
    for idx in 0..archive.len() {
        let mut file = archive.by_index(idx)?;
        let name = file.name().to_string();
        io::copy(&mut file, &mut io::sink())
            .map_err(|source| ArchiveError::Entry { name, source })?;
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct ValidationReport {
    pub checked: usize,
    pub quarantined: Vec<PathBuf>,
}

/// Check every cached `.apk` in `dir` and move the ones that fail into
/// `quarantine`. Valid archives are left where they are.
pub fn validate_cache(dir: &Path, quarantine: &Path) -> crate::Result<ValidationReport> {
    let mut report = ValidationReport::default();
    if !dir.exists() {
        return Ok(report);
    }

    for ent in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let ent = ent.map_err(|e| crate::Error::Generic(e.to_string()))?;
        let path = ent.path();
        if !ent.file_type().is_file() || !path_has_ext(path, "apk") {
            continue;
        }
        report.checked += 1;

        if let Err(e) = check_archive(path) {
            log::warn!("quarantining {:?}: {}", path, e);
            report.quarantined.push(quarantine_file(path, quarantine)?);
        }
    }

    log::info!(
        "validated {} cached archives, quarantined {}",
        report.checked,
        report.quarantined.len()
    );
    Ok(report)
}

/// Move a single file into the quarantine directory, returning its new path
pub fn quarantine_file(path: &Path, quarantine: &Path) -> crate::Result<PathBuf> {
    ensure_dir_exists(quarantine)?;
    let name = path
        .file_name()
        .ok_or_else(|| crate::Error::BadPath(path.into()))?;
    let dest = quarantine.join(name);
    move_file(path, &dest)?;
    Ok(dest)
}
