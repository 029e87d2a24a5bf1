use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[cfg(feature = "sql")]
use crate::db;
use crate::utils::path_lossy;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("required binary `{0}` not available to context")]
    MissingBin(String),
    #[error("missing required env var: {0}")]
    MissingEnv(String),

    #[error("{0}")]
    IO(io::Error),

    #[error("command failed with status {0}: {1}")]
    CommandError(i32, String),

    #[error("task was cancelled by user")]
    Cancelled,

    #[error("no connection available, all {0} pooled connections are checked out")]
    PoolExhausted(usize),

    #[error("server busy: {0} analysis sessions already active, try again later")]
    CapacityExceeded(usize),

    #[error("session {0} is already registered")]
    DuplicateSession(String),

    #[error("invalid content hash {0:?}")]
    InvalidHash(String),

    #[error("failed to get basedirs")]
    NoBaseDirs,

    #[error("bad path {0:?}")]
    BadPath(PathBuf),

    #[error("generic error: {0}")]
    Generic(String),

    #[error("invalid config {0}: {1}")]
    InvalidConfig(String, String),

    #[error("file {0} doesn't exist")]
    MissingFile(String),
}

impl Error {
    pub fn new_generic<S: ToString + ?Sized>(s: &S) -> Self {
        Self::Generic(s.to_string())
    }

    pub fn new_cfg<S: ToString + ?Sized>(path: &Path, s: &S) -> Self {
        Self::InvalidConfig(path_lossy(path), s.to_string())
    }

    /// True for failures that mean "try again later" rather than bad input
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, Self::PoolExhausted(_) | Self::CapacityExceeded(_))
    }
}

#[cfg(feature = "sql")]
impl From<db::Error> for Error {
    fn from(value: db::Error) -> Self {
        Self::Generic(value.to_string())
    }
}

impl From<Box<dyn std::error::Error + Send + Sync>> for Error {
    fn from(value: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self::Generic(value.to_string())
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::IO(err)
    }
}
