use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use rand::Rng;
use rstest::fixture;

use crate::config::Config;
use crate::context::{CONFIG_FILE_NAME, PROJECT_HOME_ENV};
use crate::Context;

#[fixture]
pub fn tmp_context() -> TestContext {
    TestContext::default()
}

/// A [Context] rooted in a scratch directory with its own env and binaries
pub struct TestContext {
    base_dir: PathBuf,
    env: HashMap<String, String>,
    bins: HashMap<String, String>,
    project_config: OnceCell<Option<Config>>,
    owned: bool,
}

impl TestContext {
    /// A context over an existing directory that is left alone on drop
    pub fn rooted_at(dir: &Path) -> Self {
        let mut env = HashMap::new();
        env.insert(PROJECT_HOME_ENV.into(), dir.to_string_lossy().into());
        Self {
            base_dir: dir.to_path_buf(),
            env,
            bins: HashMap::new(),
            project_config: OnceCell::new(),
            owned: false,
        }
    }

    pub fn set_env<K: AsRef<str>, V: AsRef<str>>(&mut self, key: K, value: V) -> &mut Self {
        self.env.insert(key.as_ref().into(), value.as_ref().into());
        self
    }

    pub fn set_bin<K: AsRef<str>, V: AsRef<str>>(&mut self, key: K, bin: V) -> &mut Self {
        self.bins.insert(key.as_ref().into(), bin.as_ref().into());
        self
    }

    pub fn get_base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn get_temp_path(&self, suffix: Option<&str>) -> PathBuf {
        let rand_name: u64 = rand::thread_rng().gen();
        let name = match suffix {
            Some(v) => format!("{}.{}", rand_name, v),
            None => rand_name.to_string(),
        };
        self.base_dir.join(name)
    }
}

impl Drop for TestContext {
    fn drop(&mut self) {
        if self.owned && self.base_dir.exists() {
            _ = fs::remove_dir_all(&self.base_dir);
        }
    }
}

impl Default for TestContext {
    fn default() -> Self {
        let rand_name: u64 = rand::thread_rng().gen();
        let td = std::env::temp_dir().join(format!("apktrail_test_base_{}", rand_name));
        fs::create_dir_all(&td).expect("failed to create test dir");
        let mut it = Self::rooted_at(&td);
        it.owned = true;
        it
    }
}

impl Context for TestContext {
    fn maybe_get_env(&self, key: &str) -> Option<String> {
        self.env.get(key).cloned()
    }

    fn maybe_get_bin(&self, bin: &str) -> Option<String> {
        self.bins.get(bin).cloned()
    }

    fn get_project_config<'a>(&'a self) -> crate::Result<Option<&'a Config>> {
        let cfg = self.project_config.get_or_try_init(|| {
            let path = self.get_project_dir_child(CONFIG_FILE_NAME)?;
            if path.exists() {
                Config::parse(&path).map(Some)
            } else {
                Ok(None)
            }
        })?;
        Ok(cfg.as_ref())
    }

    fn get_cache_dir(&self) -> crate::Result<PathBuf> {
        Ok(self.base_dir.join("user_cache"))
    }
}
