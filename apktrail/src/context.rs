use std::env;
use std::path::PathBuf;
use std::sync::Mutex;

use blanket::blanket;
use directories::BaseDirs;
use once_cell::sync::OnceCell;
use which::{which, which_in};

use crate::config::{Config, Settings};
use crate::utils::ensure_dir_exists;
use crate::Error;

pub const PROJECT_HOME_ENV: &str = "APKTRAIL_HOME";
pub const BIN_PATH_ENV: &str = "APKTRAIL_PATH";
pub const CONFIG_FILE_NAME: &str = "apktrail.toml";

fn find_program(bin: &str) -> Option<String> {
    let found = match env::var(BIN_PATH_ENV) {
        Ok(search) => {
            let cwd = env::current_dir().ok()?;
            which_in(bin, Some(&search), &cwd).ok()
        }
        Err(_) => which(bin).ok(),
    };
    found.map(|it| it.to_string_lossy().into())
}

/// Context standardizes file locations, finds binaries, and looks up env
/// vars.
///
/// Most methods have a default implementation that is fine to leave
/// unchanged.
#[blanket(derive(Ref, Box))]
pub trait Context: Send + Sync {
    fn maybe_get_env(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    fn maybe_get_bin(&self, bin: &str) -> Option<String> {
        find_program(bin)
    }

    fn get_bin(&self, bin: &str) -> crate::Result<String> {
        self.maybe_get_bin(bin)
            .ok_or_else(|| Error::MissingBin(bin.into()))
    }

    fn get_env(&self, key: &str) -> crate::Result<String> {
        self.maybe_get_env(key)
            .ok_or_else(|| Error::MissingEnv(key.into()))
    }

    /// `APKTRAIL_HOME` if set, otherwise the working directory
    fn get_project_dir(&self) -> crate::Result<PathBuf> {
        let home = match self.maybe_get_env(PROJECT_HOME_ENV) {
            Some(v) => PathBuf::from(v),
            None => env::current_dir()?,
        };
        if !home.is_dir() {
            return Err(Error::Generic(format!(
                "{} set to {}, but that directory doesn't exist",
                PROJECT_HOME_ENV,
                home.display()
            )));
        }
        Ok(home)
    }

    fn get_project_dir_child(&self, child: &str) -> crate::Result<PathBuf> {
        self.get_project_dir().map(|x| x.join(child))
    }

    fn get_project_config_file(&self) -> crate::Result<PathBuf> {
        self.get_project_dir_child(CONFIG_FILE_NAME)
    }

    fn get_project_config<'a>(&'a self) -> crate::Result<Option<&'a Config>>;

    /// Settings from the project config, or defaults if there is none
    fn get_settings(&self) -> crate::Result<Settings> {
        match self.get_project_config()? {
            Some(cfg) => cfg.settings(),
            None => Ok(Settings::default()),
        }
    }

    fn get_output_dir(&self) -> crate::Result<PathBuf> {
        self.get_project_dir_child("apktrail_out")
    }

    fn get_output_dir_child(&self, child: &str) -> crate::Result<PathBuf> {
        self.get_output_dir().map(|x| x.join(child))
    }

    fn get_apk_cache_dir(&self) -> crate::Result<PathBuf> {
        self.get_output_dir_child("apk_cache")
    }

    fn get_quarantine_dir(&self) -> crate::Result<PathBuf> {
        self.get_output_dir_child("trash")
    }

    fn get_sqlite_dir(&self) -> crate::Result<PathBuf> {
        self.get_output_dir_child("sqlite")
    }

    /// The user level cache, independent of any project
    fn get_cache_dir(&self) -> crate::Result<PathBuf> {
        let dir = BaseDirs::new().ok_or(Error::NoBaseDirs)?;
        let cache = dir.cache_dir().join("apktrail");
        ensure_dir_exists(&cache)?;
        Ok(cache)
    }

    fn get_user_config_dir(&self) -> crate::Result<PathBuf> {
        let bd = BaseDirs::new().ok_or(Error::NoBaseDirs)?;
        Ok(bd.config_dir().join("apktrail"))
    }
}

pub struct DefaultContext {
    bin_cache: Mutex<Vec<(String, String)>>,
    config_override: Option<PathBuf>,
    project_config: OnceCell<Option<Config>>,
}

impl Default for DefaultContext {
    fn default() -> Self {
        Self {
            bin_cache: Mutex::new(Vec::new()),
            config_override: None,
            project_config: OnceCell::new(),
        }
    }
}

impl DefaultContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the config from `path` instead of the project directory
    pub fn with_config_file(path: PathBuf) -> Self {
        Self {
            config_override: Some(path),
            ..Self::default()
        }
    }
}

impl Context for DefaultContext {
    fn get_project_config_file(&self) -> crate::Result<PathBuf> {
        match &self.config_override {
            Some(v) => Ok(v.clone()),
            None => self.get_project_dir_child(CONFIG_FILE_NAME),
        }
    }

    fn get_project_config<'a>(&'a self) -> crate::Result<Option<&'a Config>> {
        let cfg = self
            .project_config
            .get_or_try_init(|| -> crate::Result<Option<Config>> {
                let path = self.get_project_config_file()?;
                if path.exists() {
                    log::debug!("loading config from {}", path.display());
                    Ok(Some(Config::parse(&path)?))
                } else if self.config_override.is_some() {
                    Err(Error::MissingFile(path.to_string_lossy().into()))
                } else {
                    Ok(None)
                }
            })?;
        Ok(cfg.as_ref())
    }

    fn maybe_get_bin(&self, prog: &str) -> Option<String> {
        let mut cache = self.bin_cache.lock().expect("bin cache poisoned");
        if let Some((_, path)) = cache.iter().find(|(name, _)| name == prog) {
            return Some(path.clone());
        }
        let found = find_program(prog)?;
        cache.push((prog.into(), found.clone()));
        Some(found)
    }
}
