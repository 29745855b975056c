//! SQLite backend over the force-push event dataset.
//!
//! Schema: table `push_events` with columns `organization`, `repository`,
//! `commit_sha`, `before_sha`, `pushed_at`, and (in newer exports) `stars`.
//! `pushed_at` may be ISO 8601 text or a unix epoch integer depending on
//! which ingestion version produced the file; both are accepted.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags};
use std::collections::HashSet;
use std::path::Path;

use super::{EventBackend, SourceError};
use crate::target::CommitTarget;

const EVENTS_TABLE: &str = "push_events";

#[derive(Debug)]
pub struct EventsDb {
    conn: Connection,
    has_stars: bool,
}

impl EventsDb {
    pub fn open(path: &Path) -> Result<EventsDb, SourceError> {
        let unavailable = |detail: String| SourceError::Unavailable {
            what: format!("events database {}", path.display()),
            detail,
        };

        if !path.exists() {
            return Err(unavailable("file does not exist".to_string()));
        }
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .map_err(|e| unavailable(e.to_string()))?;

        let has_stars = table_has_column(&conn, EVENTS_TABLE, "stars")
            .map_err(|e| unavailable(e.to_string()))?;

        // Fail now, not at enumeration time, if the table is missing
        conn.query_row(&format!("SELECT COUNT(*) FROM {EVENTS_TABLE}"), [], |row| {
            row.get::<_, i64>(0)
        })
        .map_err(|e| unavailable(e.to_string()))?;

        Ok(EventsDb { conn, has_stars })
    }

    fn query_targets(&self, where_org: Option<&str>) -> Result<Vec<CommitTarget>, SourceError> {
        let stars_expr = if self.has_stars { "stars" } else { "NULL" };
        let sql = match where_org {
            Some(_) => format!(
                "SELECT organization, repository, commit_sha, before_sha, pushed_at, {stars_expr} \
                 FROM {EVENTS_TABLE} WHERE organization = ?1"
            ),
            None => format!(
                "SELECT organization, repository, commit_sha, before_sha, pushed_at, {stars_expr} \
                 FROM {EVENTS_TABLE}"
            ),
        };

        let query_err = |e: rusqlite::Error| SourceError::Unavailable {
            what: "events database".to_string(),
            detail: e.to_string(),
        };

        let mut stmt = self.conn.prepare(&sql).map_err(query_err)?;
        let mut rows = match where_org {
            Some(org) => stmt.query([org]),
            None => stmt.query([]),
        }
        .map_err(query_err)?;

        let mut targets = Vec::new();
        let mut row_idx = 0usize;
        while let Some(row) = rows.next().map_err(query_err)? {
            row_idx += 1;
            match parse_row(row) {
                Ok(target) => targets.push(target),
                Err(detail) => {
                    log::warn!("skipping malformed event row {row_idx}: {detail}");
                }
            }
        }
        Ok(targets)
    }
}

fn parse_row(row: &rusqlite::Row<'_>) -> Result<CommitTarget, String> {
    let organization: String = row.get(0).map_err(|e| e.to_string())?;
    let repository: String = row.get(1).map_err(|e| e.to_string())?;
    let commit: String = row.get(2).map_err(|e| e.to_string())?;
    if organization.is_empty() || repository.is_empty() || commit.is_empty() {
        return Err("empty organization, repository, or commit".to_string());
    }
    let before_commit: Option<String> = row.get(3).map_err(|e| e.to_string())?;
    let pushed_at = parse_timestamp(row.get_ref(4).map_err(|e| e.to_string())?);
    let stars: Option<u32> = row
        .get::<_, Option<i64>>(5)
        .map_err(|e| e.to_string())?
        .and_then(|s| u32::try_from(s).ok());

    Ok(CommitTarget {
        organization,
        repository,
        commit,
        before_commit: before_commit.filter(|s| !s.is_empty()),
        stars,
        pushed_at,
    })
}

/// `pushed_at` arrives as epoch seconds or ISO 8601 text.
fn parse_timestamp(value: rusqlite::types::ValueRef<'_>) -> Option<DateTime<Utc>> {
    use rusqlite::types::ValueRef;
    match value {
        ValueRef::Integer(secs) => DateTime::from_timestamp(secs, 0),
        ValueRef::Text(bytes) => {
            let text = std::str::from_utf8(bytes).ok()?;
            DateTime::parse_from_rfc3339(text)
                .map(|dt| dt.with_timezone(&Utc))
                .ok()
                .or_else(|| {
                    // "2024-01-31 17:02:11" without zone, as sqlite3 .import writes it
                    chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S")
                        .map(|naive| naive.and_utc())
                        .ok()
                })
        }
        _ => None,
    }
}

impl EventBackend for EventsDb {
    fn all_commit_targets(&self) -> Result<Vec<CommitTarget>, SourceError> {
        self.query_targets(None)
    }

    fn commit_targets_for_org(&self, org: &str) -> Result<Vec<CommitTarget>, SourceError> {
        self.query_targets(Some(org))
    }

    fn has_stars(&self) -> bool {
        self.has_stars
    }

    fn organizations(&self) -> Result<HashSet<String>, SourceError> {
        let query_err = |e: rusqlite::Error| SourceError::Unavailable {
            what: "events database".to_string(),
            detail: e.to_string(),
        };
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT DISTINCT organization FROM {EVENTS_TABLE}"))
            .map_err(query_err)?;
        let orgs = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(query_err)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(orgs)
    }
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
