use std::borrow::Cow;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::time::Duration;

use toml::{Table, Value};

use crate::dex::LengthMode;
use crate::download::{
    DownloaderOptions, DEFAULT_BACKOFF, DEFAULT_CYCLES, DEFAULT_ENDPOINT, DEFAULT_MAX_ATTEMPTS,
    MIN_ARTIFACT_SIZE,
};
use crate::extract::HighlightRule;
use crate::strings::DecoderKind;
use crate::utils::{path_lossy, read_file};

pub const API_KEY_ENV: &str = "APKTRAIL_API_KEY";
pub const DEFAULT_MAX_VERSIONS: usize = 12;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    InvalidType,
    MissingKey,
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::InvalidType => "InvalidType",
            Self::MissingKey => "MissingKey",
        })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A view into one table of a parsed config file that knows its dotted path
/// for error messages
pub struct ConfigMap<'c> {
    path: &'c Path,
    name: Option<Cow<'c, str>>,
    table: &'c Table,
}

/// A parsed `apktrail.toml`
#[derive(Clone, Debug)]
pub struct Config {
    path: PathBuf,
    base: Table,
}

impl Config {
    pub fn parse(source: &Path) -> crate::Result<Self> {
        let as_str = read_file(source)?;
        Self::parse_str(source, &as_str)
    }

    pub fn parse_str(source: &Path, content: &str) -> crate::Result<Self> {
        let base: Table = toml::from_str(content).map_err(|e| crate::Error::new_cfg(source, &e))?;
        Ok(Self {
            base,
            path: source.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get_map(&self) -> ConfigMap<'_> {
        ConfigMap {
            name: None,
            path: &self.path,
            table: &self.base,
        }
    }

    pub fn settings(&self) -> crate::Result<Settings> {
        Settings::from_map(&self.get_map())
    }
}

impl<'c> ConfigMap<'c> {
    fn key_path<'a>(&self, key: &'a str) -> Cow<'a, str> {
        match &self.name {
            None => Cow::Borrowed(key),
            Some(v) => Cow::Owned(format!("{}.{}", v, key)),
        }
    }

    pub fn missing_key(&self, key: &str) -> crate::Error {
        crate::Error::InvalidConfig(
            path_lossy(self.path),
            format!("missing key: {}", self.key_path(key)),
        )
    }

    pub fn invalid_key(&self, key: &str, expected: &str) -> crate::Error {
        crate::Error::InvalidConfig(
            path_lossy(self.path),
            format!(
                "invalid value for key: {} (expected type: {})",
                self.key_path(key),
                expected
            ),
        )
    }

    pub fn has(&self, key: &str) -> bool {
        self.table.contains_key(key)
    }

    fn get(&self, key: &str) -> Option<&'c Value> {
        self.table.get(key)
    }

    fn typed<T>(&self, key: &str, conv: impl FnOnce(&'c Value) -> Option<T>) -> Result<Option<T>> {
        match self.get(key) {
            Some(v) => conv(v).map(Some).ok_or(Error::InvalidType),
            None => Ok(None),
        }
    }

    pub fn maybe_get_int(&self, key: &str) -> Result<Option<i64>> {
        self.typed(key, Value::as_integer)
    }

    pub fn maybe_get_str(&self, key: &str) -> Result<Option<&'c str>> {
        self.typed(key, Value::as_str)
    }

    pub fn maybe_get_bool(&self, key: &str) -> Result<Option<bool>> {
        self.typed(key, Value::as_bool)
    }

    pub fn get_str(&self, key: &str) -> Result<&'c str> {
        self.maybe_get_str(key)?.ok_or(Error::MissingKey)
    }

    pub fn get_int(&self, key: &str) -> Result<i64> {
        self.maybe_get_int(key)?.ok_or(Error::MissingKey)
    }

    pub fn get_bool_or(&self, key: &str, default: bool) -> bool {
        self.maybe_get_bool(key).ok().flatten().unwrap_or(default)
    }

    pub fn maybe_get_str_typecheck(&self, key: &str) -> crate::Result<Option<&'c str>> {
        self.maybe_get_str(key)
            .map_err(|_| self.invalid_key(key, "string"))
    }

    pub fn maybe_get_bool_typecheck(&self, key: &str) -> crate::Result<Option<bool>> {
        self.maybe_get_bool(key)
            .map_err(|_| self.invalid_key(key, "bool"))
    }

    /// Get a non negative integer, rejecting negative values the same as the
    /// wrong type
    pub fn maybe_get_uint_typecheck(&self, key: &str) -> crate::Result<Option<u64>> {
        match self.maybe_get_int(key) {
            Ok(Some(v)) if v >= 0 => Ok(Some(v as u64)),
            Ok(None) => Ok(None),
            _ => Err(self.invalid_key(key, "unsigned int")),
        }
    }

    pub fn must_get_str(&self, key: &str) -> crate::Result<&'c str> {
        match self.get_str(key) {
            Err(Error::InvalidType) => Err(self.invalid_key(key, "string")),
            Err(Error::MissingKey) => Err(self.missing_key(key)),
            Ok(v) => Ok(v),
        }
    }

    pub fn maybe_get_array(&self, key: &str) -> Result<Option<&'c Vec<Value>>> {
        self.typed(key, Value::as_array)
    }

    pub fn maybe_get_map(&self, key: &str) -> Result<Option<ConfigMap<'c>>> {
        let Some(table) = self.typed(key, Value::as_table)? else {
            return Ok(None);
        };
        let name = match &self.name {
            Some(parents) => format!("{parents}.{key}"),
            None => key.to_string(),
        };
        Ok(Some(ConfigMap {
            name: Some(Cow::Owned(name)),
            path: self.path,
            table,
        }))
    }

    pub fn get_map(&self, key: &str) -> Result<ConfigMap<'c>> {
        self.maybe_get_map(key)?.ok_or(Error::MissingKey)
    }

    pub fn maybe_get_map_typecheck(&self, key: &str) -> crate::Result<Option<ConfigMap<'c>>> {
        self.maybe_get_map(key)
            .map_err(|_| self.invalid_key(key, "table"))
    }
}

pub fn parse_config<R, F>(file: &Path, f: F) -> crate::Result<R>
where
    F: FnOnce(&ConfigMap) -> crate::Result<R>,
{
    let cfg = Config::parse(file)?;
    f(&cfg.get_map())
}

#[derive(Debug, Clone)]
pub struct DownloadSettings {
    pub max_attempts: u32,
    pub cycles: u32,
    pub backoff: Duration,
    pub min_size: u64,
    pub request_timeout: Duration,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            cycles: DEFAULT_CYCLES,
            backoff: DEFAULT_BACKOFF,
            min_size: MIN_ARTIFACT_SIZE,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl DownloadSettings {
    pub fn downloader_options(&self) -> DownloaderOptions {
        DownloaderOptions {
            backoff: self.backoff,
            min_size: self.min_size,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    /// Defaults to a file in the context's sqlite directory
    pub path: Option<PathBuf>,
    pub max_connections: usize,
    pub busy_timeout_ms: u32,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: None,
            max_connections: crate::pool::DEFAULT_POOL_CAPACITY,
            busy_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessingSettings {
    pub decoder: DecoderKind,
    pub external_decoder: Option<String>,
    pub length_mode: LengthMode,
    /// `None` lets the pool size itself from the CPU count
    pub worker_threads: Option<usize>,
    pub single_core: bool,
    pub max_versions: usize,
}

impl Default for ProcessingSettings {
    fn default() -> Self {
        Self {
            decoder: DecoderKind::Builtin,
            external_decoder: None,
            length_mode: LengthMode::default(),
            worker_threads: None,
            single_core: false,
            max_versions: DEFAULT_MAX_VERSIONS,
        }
    }
}

impl ProcessingSettings {
    pub fn effective_workers(&self) -> usize {
        if self.single_core {
            return 1;
        }
        self.worker_threads
            .unwrap_or_else(|| std::thread::available_parallelism().map_or(1, |n| n.get()))
            .max(1)
    }
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub timeout: Duration,
    /// Overrides the capacity detected from the host
    pub max_concurrent: Option<usize>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            timeout: crate::admission::DEFAULT_SESSION_TIMEOUT,
            max_concurrent: None,
        }
    }
}

/// Everything the pipeline reads from `apktrail.toml`
#[derive(Debug, Clone)]
pub struct Settings {
    pub api_key: Option<String>,
    pub download_endpoint: String,
    pub download: DownloadSettings,
    pub database: DatabaseSettings,
    pub processing: ProcessingSettings,
    pub sessions: SessionSettings,
    pub highlights: Vec<HighlightRule>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_key: None,
            download_endpoint: DEFAULT_ENDPOINT.into(),
            download: DownloadSettings::default(),
            database: DatabaseSettings::default(),
            processing: ProcessingSettings::default(),
            sessions: SessionSettings::default(),
            highlights: Vec::new(),
        }
    }
}

fn to_u32(map: &ConfigMap, key: &str, v: u64) -> crate::Result<u32> {
    u32::try_from(v).map_err(|_| map.invalid_key(key, "u32"))
}

impl Settings {
    pub fn load(path: &Path) -> crate::Result<Self> {
        parse_config(path, Self::from_map)
    }

    pub fn from_map(map: &ConfigMap) -> crate::Result<Self> {
        let mut settings = Self::default();

        settings.api_key = map.maybe_get_str_typecheck("api_key")?.map(String::from);
        if let Some(ep) = map.maybe_get_str_typecheck("download_endpoint")? {
            settings.download_endpoint = ep.into();
        }

        if let Some(dl) = map.maybe_get_map_typecheck("download")? {
            let s = &mut settings.download;
            if let Some(v) = dl.maybe_get_uint_typecheck("max_attempts")? {
                s.max_attempts = to_u32(&dl, "max_attempts", v)?;
            }
            if let Some(v) = dl.maybe_get_uint_typecheck("cycles")? {
                s.cycles = to_u32(&dl, "cycles", v)?;
            }
            if let Some(v) = dl.maybe_get_uint_typecheck("backoff_secs")? {
                s.backoff = Duration::from_secs(v);
            }
            if let Some(v) = dl.maybe_get_uint_typecheck("min_size")? {
                s.min_size = v;
            }
            if let Some(v) = dl.maybe_get_uint_typecheck("request_timeout_secs")? {
                s.request_timeout = Duration::from_secs(v);
            }
        }

        if let Some(db) = map.maybe_get_map_typecheck("database")? {
            let s = &mut settings.database;
            s.path = db.maybe_get_str_typecheck("path")?.map(PathBuf::from);
            if let Some(v) = db.maybe_get_uint_typecheck("max_connections")? {
                if v == 0 {
                    return Err(db.invalid_key("max_connections", "positive int"));
                }
                s.max_connections = v as usize;
            }
            if let Some(v) = db.maybe_get_uint_typecheck("busy_timeout_ms")? {
                s.busy_timeout_ms = to_u32(&db, "busy_timeout_ms", v)?;
            }
        }

        if let Some(proc) = map.maybe_get_map_typecheck("processing")? {
            let s = &mut settings.processing;
            s.decoder = match proc.maybe_get_str_typecheck("decoder")? {
                None | Some("builtin") => DecoderKind::Builtin,
                Some("external") => DecoderKind::External,
                Some(_) => return Err(proc.invalid_key("decoder", "\"builtin\" or \"external\"")),
            };
            s.external_decoder = proc
                .maybe_get_str_typecheck("external_decoder")?
                .map(String::from);
            if s.decoder == DecoderKind::External && s.external_decoder.is_none() {
                return Err(proc.missing_key("external_decoder"));
            }
            s.length_mode = match proc.maybe_get_str_typecheck("length_mode")? {
                None | Some("utf16_units") => LengthMode::Utf16Units,
                Some("bytes") => LengthMode::Bytes,
                Some(_) => {
                    return Err(proc.invalid_key("length_mode", "\"utf16_units\" or \"bytes\""))
                }
            };
            s.worker_threads = proc
                .maybe_get_uint_typecheck("worker_threads")?
                .map(|it| it as usize);
            s.single_core = proc.maybe_get_bool_typecheck("single_core")?.unwrap_or(false);
            if let Some(v) = proc.maybe_get_uint_typecheck("max_versions")? {
                s.max_versions = v as usize;
            }
        }

        if let Some(sess) = map.maybe_get_map_typecheck("sessions")? {
            let s = &mut settings.sessions;
            if let Some(v) = sess.maybe_get_uint_typecheck("timeout_secs")? {
                s.timeout = Duration::from_secs(v);
            }
            s.max_concurrent = sess
                .maybe_get_uint_typecheck("max_concurrent")?
                .map(|it| it as usize);
        }

        // highlight = [["regex", "label"], ...], later entries win
        if let Some(rules) = map
            .maybe_get_array("highlight")
            .map_err(|_| map.invalid_key("highlight", "array"))?
        {
            for rule in rules {
                let pair = rule
                    .as_array()
                    .filter(|it| it.len() == 2)
                    .and_then(|it| Some((it[0].as_str()?, it[1].as_str()?)))
                    .ok_or_else(|| map.invalid_key("highlight", "[pattern, label] pairs"))?;
                settings.highlights.push(HighlightRule::new(pair.0, pair.1)?);
            }
        }

        Ok(settings)
    }

    /// The file's credential, falling back to `APKTRAIL_API_KEY`
    pub fn api_key(&self, ctx: &dyn crate::Context) -> crate::Result<String> {
        match &self.api_key {
            Some(v) => Ok(v.clone()),
            None => ctx.get_env(API_KEY_ENV),
        }
    }
}
