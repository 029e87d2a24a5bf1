use std::io::Read;

use diesel::prelude::*;
use diesel::SqliteConnection;

use super::models::ApkRecord;
use super::schema::apks;
use super::{Error, Result, SqliteConnector};
use crate::pool::ConnectionPool;

const INSERT_CHUNK: usize = 500;

/// Queries against the table of known package builds. Every call checks a
/// connection out of the pool for the calling thread.
pub struct ApkIndex<'a> {
    pool: &'a ConnectionPool<SqliteConnector>,
}

impl<'a> ApkIndex<'a> {
    pub fn new(pool: &'a ConnectionPool<SqliteConnector>) -> Self {
        Self { pool }
    }

    fn with_connection<R, F>(&self, f: F) -> crate::Result<R>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<R>,
    {
        let conn = self.pool.checkout()?;
        Ok(conn.with(f)?)
    }

    /// Builds of `pkg` scanned within `[start, end]`, oldest first
    pub fn find_versions(
        &self,
        pkg: &str,
        start: &str,
        end: &str,
    ) -> crate::Result<Vec<ApkRecord>> {
        self.with_connection(|conn| {
            let found = query!(apks::table
                .filter(apks::pkg_name.eq(pkg))
                .filter(apks::vt_scan_date.between(start, end))
                .order((apks::vt_scan_date.asc(), apks::sha256.asc()))
                .select(ApkRecord::as_select()))
            .load(conn)?;
            Ok(found)
        })
    }

    /// Hashes are stored lowercase, `sha256` may be given in either case
    pub fn get(&self, sha256: &str) -> crate::Result<Option<ApkRecord>> {
        let sha256 = sha256.to_ascii_lowercase();
        self.with_connection(|conn| {
            let found = query!(apks::table
                .find(&sha256)
                .select(ApkRecord::as_select()))
            .first(conn)
            .optional()?;
            Ok(found)
        })
    }

    /// Insert records, skipping hashes already present. Returns how many
    /// rows were added.
    pub fn insert_records(&self, records: &[ApkRecord]) -> crate::Result<usize> {
        self.with_connection(|conn| insert_records(conn, records))
    }

    pub fn count(&self) -> crate::Result<i64> {
        self.with_connection(|conn| Ok(query!(apks::table.count()).get_result(conn)?))
    }

    /// Import an AndroZoo style listing. Columns are located by header name
    /// and anything besides `sha256`, `pkg_name`, `vercode` and
    /// `vt_scan_date` is ignored.
    pub fn import_csv<R: Read>(&self, reader: R) -> crate::Result<CsvImport> {
        let mut rdr = csv::Reader::from_reader(reader);
        let columns = CsvColumns::from_headers(rdr.headers().map_err(Error::from)?)?;

        let mut stats = CsvImport::default();
        let mut batch = Vec::with_capacity(INSERT_CHUNK);
        for row in rdr.records() {
            let row = row.map_err(Error::from)?;
            stats.rows += 1;
            match columns.record(&row) {
                Some(rec) => batch.push(rec),
                None => stats.skipped += 1,
            }
            if batch.len() == INSERT_CHUNK {
                stats.inserted += self.insert_records(&batch)?;
                batch.clear();
            }
        }
        if !batch.is_empty() {
            stats.inserted += self.insert_records(&batch)?;
        }
        log::info!(
            "imported {} of {} rows ({} unusable)",
            stats.inserted,
            stats.rows,
            stats.skipped
        );
        Ok(stats)
    }
}

fn insert_records(conn: &mut SqliteConnection, records: &[ApkRecord]) -> Result<usize> {
    conn.transaction(|conn| {
        let mut added = 0;
        for chunk in records.chunks(INSERT_CHUNK) {
            added +=
                query!(diesel::insert_or_ignore_into(apks::table).values(chunk)).execute(conn)?;
        }
        Ok::<usize, Error>(added)
    })
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CsvImport {
    pub rows: usize,
    pub inserted: usize,
    pub skipped: usize,
}

struct CsvColumns {
    sha256: usize,
    pkg_name: usize,
    vercode: Option<usize>,
    vt_scan_date: Option<usize>,
}

impl CsvColumns {
    fn from_headers(headers: &csv::StringRecord) -> Result<Self> {
        let find = |name: &str| headers.iter().position(|it| it.trim() == name);
        Ok(Self {
            sha256: find("sha256").ok_or_else(|| Error::Csv("missing sha256 column".into()))?,
            pkg_name: find("pkg_name")
                .ok_or_else(|| Error::Csv("missing pkg_name column".into()))?,
            vercode: find("vercode"),
            vt_scan_date: find("vt_scan_date"),
        })
    }

    fn record(&self, row: &csv::StringRecord) -> Option<ApkRecord> {
        let field = |idx: Option<usize>| {
            idx.and_then(|i| row.get(i))
                .map(|it| it.trim().trim_matches('"').to_string())
                .unwrap_or_default()
        };
        let sha256 = field(Some(self.sha256)).to_ascii_lowercase();
        let pkg_name = field(Some(self.pkg_name));
        if !crate::utils::is_sha256_hex(&sha256) || pkg_name.is_empty() {
            return None;
        }
        Some(ApkRecord {
            sha256,
            pkg_name,
            vercode: field(self.vercode),
            vt_scan_date: field(self.vt_scan_date),
        })
    }
}
