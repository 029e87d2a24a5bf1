use std::fmt::Display;
use std::path::Path;

use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorInformation, DatabaseErrorKind, Error as DieselError};
use diesel::{ConnectionError, SqliteConnection};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

use crate::pool::ConnectionFactory;
use crate::utils::ensure_dir_exists;

#[cfg(feature = "trace_db")]
macro_rules! query {
    ($q:expr) => {{
        let __query = $q;
        ::log::trace!(
            "{}",
            diesel::debug_query::<::diesel::sqlite::Sqlite, _>(&__query)
        );

        __query
    }};
}

#[cfg(not(feature = "trace_db"))]
macro_rules! query {
    ($q:expr) => {
        $q
    };
}

pub mod index;
pub use index::{ApkIndex, CsvImport};
pub mod models;
pub use models::ApkRecord;
pub mod schema;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations/index/");

pub const DEFAULT_BUSY_TIMEOUT_MS: u32 = 30_000;

#[derive(Debug)]
pub struct DBErrorInfo {
    pub message: String,
    pub details: Option<String>,
}

impl From<Box<dyn DatabaseErrorInformation + Send + Sync>> for DBErrorInfo {
    fn from(value: Box<dyn DatabaseErrorInformation + Send + Sync>) -> Self {
        Self {
            message: value.message().into(),
            details: value.details().map(|it| it.to_string()),
        }
    }
}

impl Display for DBErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(details) = self.details.as_ref() {
            write!(f, "\nDetails:\n{}", details)?;
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("connection error: {0}")]
    ConnectionError(ConnectionError),
    #[error("requested database entry not found")]
    NotFound,
    #[error("database error {0:?}: {1}")]
    DatabaseError(DatabaseErrorKind, DBErrorInfo),
    #[error("{0}")]
    UniqueViolation(DBErrorInfo),
    #[error("migration failed: {0}")]
    Migration(String),
    #[error("bad csv input: {0}")]
    Csv(String),
    #[error("generic database error: {0}")]
    Generic(String),
}

impl From<DieselError> for Error {
    fn from(value: DieselError) -> Self {
        match value {
            DieselError::NotFound => Self::NotFound,
            DieselError::DatabaseError(kind, info) => match kind {
                DatabaseErrorKind::UniqueViolation => Self::UniqueViolation(info.into()),
                _ => Self::DatabaseError(kind, info.into()),
            },
            DieselError::QueryBuilderError(e) => Self::Generic(e.to_string()),
            DieselError::DeserializationError(e) => Self::Generic(e.to_string()),
            DieselError::SerializationError(e) => Self::Generic(e.to_string()),
            DieselError::RollbackTransaction => Self::Generic("unexpected transaction error".into()),
            _ => Self::Generic(format!("unexpected error {:?}", value)),
        }
    }
}

impl From<ConnectionError> for Error {
    fn from(value: ConnectionError) -> Self {
        Self::ConnectionError(value)
    }
}

impl From<csv::Error> for Error {
    fn from(value: csv::Error) -> Self {
        Self::Csv(value.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Generic(value.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Opens connections to the sqlite index.
///
/// Every connection enforces foreign keys and waits on a busy database
/// rather than failing right away.
pub struct SqliteConnector {
    url: String,
    busy_timeout_ms: u32,
}

impl SqliteConnector {
    /// Create the database if needed and bring its schema up to date
    pub fn open(path: &Path, busy_timeout_ms: u32) -> Result<Self> {
        if let Some(parent) = path.parent() {
            ensure_dir_exists(parent)?;
        }
        let this = Self {
            url: format!("sqlite://{}", path.to_string_lossy()),
            busy_timeout_ms,
        };
        let mut conn = this.establish()?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|e| Error::Migration(e.to_string()))?;
        log::debug!("opened index database at {}", this.url);
        Ok(this)
    }

    fn establish(&self) -> Result<SqliteConnection> {
        log::trace!("connecting to the database at {}", self.url);
        let mut conn = SqliteConnection::establish(&self.url)?;
        conn.batch_execute(&format!(
            "PRAGMA foreign_keys = ON; PRAGMA busy_timeout = {};",
            self.busy_timeout_ms
        ))?;
        Ok(conn)
    }
}

impl ConnectionFactory for SqliteConnector {
    type Connection = SqliteConnection;

    fn connect(&self) -> crate::Result<SqliteConnection> {
        Ok(self.establish()?)
    }
}
