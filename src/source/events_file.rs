//! CSV backend over the force-push event export.
//!
//! Same logical schema as the SQLite backend; the header row names the
//! columns. The whole file is loaded up front; exports are small relative
//! to the scans they seed.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::path::Path;

use super::{EventBackend, SourceError};
use crate::target::CommitTarget;

#[derive(Debug)]
pub struct EventsTable {
    rows: Vec<CommitTarget>,
    has_stars: bool,
}

pub fn read_events_file(path: &Path) -> Result<EventsTable, SourceError> {
    let unavailable = |detail: String| SourceError::Unavailable {
        what: format!("events file {}", path.display()),
        detail,
    };

    let mut reader = csv::Reader::from_path(path).map_err(|e| unavailable(e.to_string()))?;
    let headers = reader.headers().map_err(|e| unavailable(e.to_string()))?.clone();
    let col = |name: &str| headers.iter().position(|h| h == name);

    let (org_col, repo_col, commit_col) = match (
        col("organization"),
        col("repository"),
        col("commit_sha"),
    ) {
        (Some(o), Some(r), Some(c)) => (o, r, c),
        _ => {
            return Err(unavailable(
                "missing required columns organization, repository, commit_sha".to_string(),
            ));
        }
    };
    let before_col = col("before_sha");
    let pushed_col = col("pushed_at");
    let stars_col = col("stars");

    let mut rows = Vec::new();
    for (idx, record) in reader.records().enumerate() {
        let line = idx + 2; // 1-based, after the header
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                log::warn!("skipping malformed event row at line {line}: {e}");
                continue;
            }
        };
        let field = |i: usize| record.get(i).unwrap_or("").trim().to_string();

        let organization = field(org_col);
        let repository = field(repo_col);
        let commit = field(commit_col);
        if organization.is_empty() || repository.is_empty() || commit.is_empty() {
            log::warn!(
                "skipping malformed event row at line {line}: empty organization, repository, or commit"
            );
            continue;
        }

        rows.push(CommitTarget {
            organization,
            repository,
            commit,
            before_commit: before_col.map(field).filter(|s| !s.is_empty()),
            stars: stars_col.and_then(|i| field(i).parse().ok()),
            pushed_at: pushed_col.and_then(|i| parse_timestamp(&field(i))),
        });
    }

    Ok(EventsTable {
        rows,
        has_stars: stars_col.is_some(),
    })
}

fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    if text.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| text.parse::<i64>().ok().and_then(|secs| DateTime::from_timestamp(secs, 0)))
}

impl EventBackend for EventsTable {
    fn all_commit_targets(&self) -> Result<Vec<CommitTarget>, SourceError> {
        Ok(self.rows.clone())
    }

    fn commit_targets_for_org(&self, org: &str) -> Result<Vec<CommitTarget>, SourceError> {
        Ok(self.rows.iter().filter(|t| t.organization == org).cloned().collect())
    }

    fn has_stars(&self) -> bool {
        self.has_stars
    }

    fn organizations(&self) -> Result<HashSet<String>, SourceError> {
        Ok(self.rows.iter().map(|t| t.organization.clone()).collect())
    }
}
