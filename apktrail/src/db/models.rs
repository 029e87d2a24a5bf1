use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use super::schema::apks;

/// One known build of a package
#[derive(Queryable, Selectable, Insertable, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[diesel(table_name = apks)]
pub struct ApkRecord {
    pub sha256: String,
    pub pkg_name: String,
    pub vercode: String,
    /// `YYYY-MM-DD HH:MM:SS`, compared as text
    pub vt_scan_date: String,
}
