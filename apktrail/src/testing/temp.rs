use std::fs;
use std::path::PathBuf;
use std::{env, io::Write};

use rand::Rng;
use rstest::fixture;

/// A scratch directory removed on drop
pub struct TmpDir {
    temp_dir: PathBuf,
    owned: bool,
}

impl TmpDir {
    pub fn get_path(&self) -> &PathBuf {
        &self.temp_dir
    }

    /// Child directory that lives as long as the parent does
    pub fn create_dir(&self, name: &str) -> TmpDir {
        let path = self.temp_dir.join(name);
        fs::create_dir_all(&path).expect("failed to make temp directory");
        TmpDir {
            temp_dir: path,
            owned: false,
        }
    }

    pub fn create_file_name(&self, name: &str, content: Option<&str>) -> PathBuf {
        self.create_file_bytes(name, content.unwrap_or("").as_bytes())
    }

    pub fn create_file_bytes(&self, name: &str, content: &[u8]) -> PathBuf {
        let path = self.temp_dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("failed to create directories for new file");
        }
        let mut f = fs::File::create(&path).expect("failed to create temp file");
        f.write_all(content).expect("failed to write temp file");
        path
    }
}

impl Drop for TmpDir {
    fn drop(&mut self) {
        if self.owned {
            _ = fs::remove_dir_all(&self.temp_dir);
        }
    }
}

#[fixture]
pub fn tmp_dir() -> TmpDir {
    let rand_name: u64 = rand::thread_rng().gen();
    let temp_dir = env::temp_dir().join(format!("apktrail_tmp_{rand_name}"));
    fs::create_dir_all(&temp_dir).expect("failed to create temp dir");
    TmpDir {
        temp_dir,
        owned: true,
    }
}
