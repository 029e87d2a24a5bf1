pub mod admission;
pub use admission::{AdmissionController, SessionId};

pub mod archive;

pub mod cache;
pub use cache::ContentCache;

pub mod command;
pub use command::run_cmd;

pub mod config;
pub use config::Settings;

pub mod context;
pub use context::{Context, DefaultContext};

pub mod dex;

pub mod download;
pub use download::{Downloader, FetchError, FetchTask};

pub mod errors;
pub use errors::{Error, Result};

pub mod extract;

pub mod manifest;
pub use manifest::ArtifactManifest;

pub mod pool;
pub use pool::ConnectionPool;

pub mod strings;
pub use strings::StringSource;

pub mod tasks;

pub mod utils;

#[cfg(feature = "sql")]
pub mod db;

#[cfg(feature = "sql")]
pub mod pipeline;
#[cfg(feature = "sql")]
pub use pipeline::Runtime;

#[cfg(feature = "reexport_diesel")]
pub use diesel;

#[cfg(test)]
pub mod testing;
