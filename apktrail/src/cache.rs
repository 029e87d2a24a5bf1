use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::utils::{bytes_to_hex, ensure_dir_exists, is_sha256_hex, open_file};
use crate::{Error, Result};

pub const ARTIFACT_EXT: &str = "apk";

const STAGING_PREFIX: &str = ".fetch-";
const STAGING_SUFFIX: &str = ".part";

/// Staging files untouched for this long are assumed abandoned
pub const STALE_STAGING_AGE: Duration = Duration::from_secs(60 * 60);

/// Content addressed store of downloaded artifacts.
///
/// An artifact with hash `H` lives at `<dir>/H.apk`. Files only ever appear
/// there through [StagedArtifact::commit], which renames a fully written
/// temporary file into place, so a present file is never a partial write.
#[derive(Debug, Clone)]
pub struct ContentCache {
    dir: PathBuf,
}

impl ContentCache {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the cache directory and tag it as a cache
    pub fn ensure_dir(&self) -> Result<()> {
        ensure_dir_exists(&self.dir)?;
        ensure_cache_dir_tag(&self.dir)
    }

    /// Where the artifact for `hash` lives, whether or not it exists yet.
    /// File names always use the lowercase form of the hash.
    pub fn path_for(&self, hash: &str) -> Result<PathBuf> {
        if !is_sha256_hex(hash) {
            return Err(Error::InvalidHash(hash.into()));
        }
        let hash = hash.to_ascii_lowercase();
        Ok(self.dir.join(format!("{hash}.{ARTIFACT_EXT}")))
    }

    /// Presence is sufficient for reuse, the content is not rehashed
    pub fn lookup(&self, hash: &str) -> Result<Option<PathBuf>> {
        let path = self.path_for(hash)?;
        Ok(path.is_file().then_some(path))
    }

    pub fn contains(&self, hash: &str) -> bool {
        matches!(self.lookup(hash), Ok(Some(_)))
    }

    /// Start writing a new artifact into the cache directory
    pub fn stage(&self) -> Result<StagedArtifact> {
        self.ensure_dir()?;
        let file = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .suffix(STAGING_SUFFIX)
            .tempfile_in(&self.dir)?;
        Ok(StagedArtifact { file, written: 0 })
    }

    /// Recompute the SHA-256 of a cached artifact and compare it to its key
    pub fn verify(&self, hash: &str) -> Result<bool> {
        let path = self.path_for(hash)?;
        let mut file = open_file(&path)?;
        let mut hasher = Sha256::new();
        io::copy(&mut file, &mut hasher)?;
        let actual = bytes_to_hex(&hasher.finalize());
        Ok(actual.eq_ignore_ascii_case(hash))
    }

    /// Remove leftovers from interrupted downloads that were last written
    /// at least `min_age` ago. Younger files may belong to a download that
    /// is still running and are left alone.
    pub fn clean_staging(&self, min_age: Duration) -> Result<usize> {
        if !self.dir.exists() {
            return Ok(0);
        }
        let now = SystemTime::now();
        let mut removed = 0;
        for ent in fs::read_dir(&self.dir)? {
            let ent = ent?;
            let name = ent.file_name();
            let name = name.to_string_lossy();
            if !(name.starts_with(STAGING_PREFIX) && name.ends_with(STAGING_SUFFIX)) {
                continue;
            }
            let modified = ent.metadata()?.modified()?;
            // Timestamps in the future count as fresh
            let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
            if age < min_age {
                log::debug!("keeping {} ({:?} old)", name, age);
                continue;
            }
            match fs::remove_file(ent.path()) {
                Ok(()) => removed += 1,
                // Committed or dropped by its writer in the meantime
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(removed)
    }
}

/// A partially downloaded artifact. Dropping it without calling
/// [StagedArtifact::commit] deletes the temporary file.
pub struct StagedArtifact {
    file: NamedTempFile,
    written: u64,
}

impl StagedArtifact {
    /// Bytes written so far
    pub fn len(&self) -> u64 {
        self.written
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Atomically move the staged file to its final location
    pub fn commit(mut self, cache: &ContentCache, hash: &str) -> Result<PathBuf> {
        let dest = cache.path_for(hash)?;
        self.file.flush()?;
        self.file.as_file().sync_all()?;
        self.file.persist(&dest).map_err(|e| Error::IO(e.error))?;
        Ok(dest)
    }
}

impl Write for StagedArtifact {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

fn ensure_cache_dir_tag(dir: &Path) -> Result<()> {
    let tag = dir.join("CACHEDIR.TAG");
    if tag.exists() {
        return Ok(());
    }

    let content = r#"Signature: 8a477f597d28d172789f06886806bc55
# This file is a cache directory tag created by apktrail.
# For information about cache directory tags, see:
#	http://www.brynosaurus.com/cachedir/
"#;

    fs::write(&tag, content)?;
    Ok(())
}
