//! Parsing, filtering, and publication of detector output.
//!
//! Only records the detector live-verified flow past this layer. Kept
//! records carry the detector's native shape untouched, augmented with the
//! scan context downstream analyzers key on: `scan_timestamp`,
//! `organization`, `repository_url`, `scanned_commit`.

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, Mutex};

/// One verified detector record, already augmented with scan context.
#[derive(Debug, Clone)]
pub struct Finding {
    pub detector_name: String,
    pub record: Value,
}

/// Scan context merged into every kept record.
#[derive(Debug, Clone)]
pub struct ScanContext {
    pub organization: String,
    pub repository_url: String,
    pub scanned_commit: String,
    pub scan_timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct ParseSummary {
    pub findings: Vec<Finding>,
    pub total_lines: usize,
    pub parsed: usize,
    pub unparseable: usize,
    pub dropped_unverified: usize,
    /// Non-JSON output claimed a verified hit; the raw output deserves a
    /// manual look even though nothing machine-readable survived.
    pub textual_hint: bool,
}

/// Parse newline-delimited detector output. Unparseable lines are logged
/// and dropped; they never abort the scan.
pub fn parse_detector_output(
    stdout_path: &Path,
    ctx: &ScanContext,
) -> std::io::Result<ParseSummary> {
    let file = std::fs::File::open(stdout_path)?;
    let reader = std::io::BufReader::new(file);

    let mut summary = ParseSummary::default();
    for line in reader.lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        summary.total_lines += 1;

        let mut record: Value = match serde_json::from_str(trimmed) {
            Ok(Value::Object(map)) => Value::Object(map),
            Ok(_) | Err(_) => {
                summary.unparseable += 1;
                if trimmed.to_lowercase().contains("found verified") {
                    summary.textual_hint = true;
                }
                log::debug!("dropping unparseable detector line: {trimmed}");
                continue;
            }
        };
        summary.parsed += 1;

        if record.get("Verified").and_then(Value::as_bool) != Some(true) {
            summary.dropped_unverified += 1;
            continue;
        }

        let detector_name = record
            .get("DetectorName")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();

        if let Some(map) = record.as_object_mut() {
            map.insert(
                "scan_timestamp".to_string(),
                Value::String(ctx.scan_timestamp.to_rfc3339()),
            );
            map.insert(
                "organization".to_string(),
                Value::String(ctx.organization.clone()),
            );
            map.insert(
                "repository_url".to_string(),
                Value::String(ctx.repository_url.clone()),
            );
            map.insert(
                "scanned_commit".to_string(),
                Value::String(ctx.scanned_commit.clone()),
            );
        }

        summary.findings.push(Finding {
            detector_name,
            record,
        });
    }
    Ok(summary)
}

#[derive(Debug)]
pub struct PublishError {
    pub detail: String,
}

impl std::fmt::Display for PublishError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "publishing findings failed: {}", self.detail)
    }
}

impl std::error::Error for PublishError {}

// Workers share per-org artifacts; serializing publishes keeps the
// read-merge-rename sequence race-free within the process.
static PUBLISH_LOCK: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

/// Place findings at `<root>/<YYYY-MM-DD>/<org>/verified_secrets_<org>.json`.
///
/// Appends to an existing artifact for the same org and day. The write goes
/// to a sibling temp file and is renamed into place, so readers never see a
/// truncated array.
pub fn publish(
    findings: &[Finding],
    organization: &str,
    results_root: &Path,
    date: NaiveDate,
) -> Result<PathBuf, PublishError> {
    let fail = |detail: String| PublishError { detail };

    let _guard = PUBLISH_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

    let dir = results_root
        .join(date.format("%Y-%m-%d").to_string())
        .join(sanitize_component(organization));
    std::fs::create_dir_all(&dir).map_err(|e| fail(e.to_string()))?;
    let path = dir.join(format!(
        "verified_secrets_{}.json",
        sanitize_component(organization)
    ));

    let mut records: Vec<Value> = match std::fs::read_to_string(&path) {
        Ok(existing) => serde_json::from_str(&existing)
            .map_err(|e| fail(format!("existing artifact {} is not valid JSON: {e}", path.display())))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(fail(e.to_string())),
    };
    records.extend(findings.iter().map(|f| f.record.clone()));

    let json = serde_json::to_string_pretty(&records).map_err(|e| fail(e.to_string()))?;

    let tmp = dir.join(format!(
        ".verified_secrets_{}.json.tmp",
        sanitize_component(organization)
    ));
    let write_result = std::fs::File::create(&tmp)
        .and_then(|mut f| f.write_all(json.as_bytes()).and_then(|()| f.sync_all()))
        .and_then(|()| std::fs::rename(&tmp, &path));
    if let Err(e) = write_result {
        // Partial files must not persist
        let _ = std::fs::remove_file(&tmp);
        return Err(fail(e.to_string()));
    }
    Ok(path)
}

/// Keep a copy of raw detector output for manual review under
/// `<root>/raw/<key>.out`.
pub fn preserve_raw(
    stdout_path: &Path,
    results_root: &Path,
    key: &str,
) -> std::io::Result<PathBuf> {
    let dir = results_root.join("raw");
    std::fs::create_dir_all(&dir)?;
    let dest = dir.join(format!("{}.out", sanitize_component(key)));
    std::fs::copy(stdout_path, &dest)?;
    Ok(dest)
}

/// Filesystem-safe rendering of a canonical key or org name.
fn sanitize_component(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            '/' | '\\' | '<' | '>' | ':' | '"' | '|' | '?' | '*' | '@' => '-',
            _ => c,
        })
        .collect()
}
