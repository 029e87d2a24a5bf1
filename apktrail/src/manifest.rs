use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::utils::ensure_dir_exists;

pub const MANIFEST_FILE_NAME: &str = "apk_log.json";

/// One fetched artifact as recorded in the manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub sha256: String,
    pub vercode: String,
    pub vtscandate: String,
}

/// Package name to the artifacts fetched for it, oldest first
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactManifest {
    packages: BTreeMap<String, Vec<ManifestEntry>>,
}

impl ArtifactManifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path_in(dir: &Path) -> PathBuf {
        dir.join(MANIFEST_FILE_NAME)
    }

    /// Load the manifest at `path`, returning an empty one if it doesn't exist
    pub fn load(path: &Path) -> crate::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let reader = BufReader::new(File::open(path)?);
        serde_json::from_reader(reader).map_err(|e| crate::Error::new_cfg(path, &e))
    }

    pub fn get(&self, package: &str) -> Option<&[ManifestEntry]> {
        self.packages.get(package).map(|it| it.as_slice())
    }

    pub fn packages(&self) -> impl Iterator<Item = &str> {
        self.packages.keys().map(|it| it.as_str())
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    /// Replace the entry list for `package`
    pub fn set(&mut self, package: &str, entries: Vec<ManifestEntry>) {
        self.packages.insert(package.into(), entries);
    }

    /// Packages present in `other` replace those in `self`, everything else
    /// is retained
    pub fn merge(&mut self, other: ArtifactManifest) {
        self.packages.extend(other.packages);
    }

    /// Write the manifest as pretty JSON. The file is replaced atomically so
    /// readers never observe a partial document.
    pub fn save(&self, path: &Path) -> crate::Result<()> {
        let dir = path
            .parent()
            .ok_or_else(|| crate::Error::BadPath(path.to_path_buf()))?;
        ensure_dir_exists(dir)?;
        let tmp = NamedTempFile::new_in(dir)?;
        {
            let mut writer = BufWriter::new(tmp.as_file());
            serde_json::to_writer_pretty(&mut writer, self)
                .map_err(|e| crate::Error::Generic(e.to_string()))?;
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| crate::Error::IO(e.error))?;
        Ok(())
    }

    /// Load whatever is on disk, merge `self` into it, and save the result
    pub fn update_file(self, path: &Path) -> crate::Result<ArtifactManifest> {
        let mut on_disk = Self::load(path)?;
        on_disk.merge(self);
        on_disk.save(path)?;
        Ok(on_disk)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::{tmp_dir, TmpDir};
    use rstest::*;
    use std::fs;

    fn entry(n: u64, vercode: &str) -> ManifestEntry {
        ManifestEntry {
            sha256: format!("{:064x}", n),
            vercode: vercode.into(),
            vtscandate: "2023-01-01 00:00:00".into(),
        }
    }

    #[rstest]
    fn test_missing_is_empty(tmp_dir: TmpDir) {
        let m = ArtifactManifest::load(&tmp_dir.get_path().join("nope.json")).unwrap();
        assert!(m.is_empty());
    }

    #[rstest]
    fn test_update_merges_packages(tmp_dir: TmpDir) {
        let path = ArtifactManifest::path_in(tmp_dir.get_path());

        let mut first = ArtifactManifest::new();
        first.set("com.a", vec![entry(1, "1")]);
        first.set("com.b", vec![entry(2, "7")]);
        first.update_file(&path).unwrap();

        let mut second = ArtifactManifest::new();
        second.set("com.a", vec![entry(3, "2"), entry(4, "3")]);
        let merged = second.update_file(&path).unwrap();

        let loaded = ArtifactManifest::load(&path).unwrap();
        assert_eq!(merged, loaded);
        assert_eq!(loaded.packages().collect::<Vec<_>>(), ["com.a", "com.b"]);
        assert_eq!(loaded.get("com.a").unwrap(), &[entry(3, "2"), entry(4, "3")]);
        assert_eq!(loaded.get("com.b").unwrap(), &[entry(2, "7")]);
    }

    #[rstest]
    fn test_document_shape(tmp_dir: TmpDir) {
        let path = ArtifactManifest::path_in(tmp_dir.get_path());
        let mut m = ArtifactManifest::new();
        m.set("com.a", vec![entry(1, "42")]);
        m.save(&path).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["com.a"][0]["vercode"], "42");
        assert_eq!(raw["com.a"][0]["vtscandate"], "2023-01-01 00:00:00");
    }

    #[rstest]
    fn test_bad_document(tmp_dir: TmpDir) {
        let path = tmp_dir.create_file_name("apk_log.json", Some("{not json"));
        assert!(ArtifactManifest::load(&path).is_err());
    }
}
