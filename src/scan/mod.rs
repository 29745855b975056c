//! The per-target scan task.
//!
//! An explicit state machine: Prepare → Fetch → Budget → Detect → Parse →
//! Publish → Cleanup, where every terminal transition passes through
//! Cleanup (the workspace guard guarantees it on unwind paths too). Retry
//! escalation, command-variant fallback, cancellation, and the hard
//! wall-clock ceiling all compose here.

pub mod budget;
pub mod detector;
pub mod findings;
pub mod workspace;

pub use findings::{Finding, ScanContext};
pub use workspace::Workspace;

use chrono::Utc;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::config::RunConfig;
use crate::exec::CancelToken;
use crate::git::{self, GitError};
use crate::target::Target;

/// Terminal state of one scan task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStatus {
    CompletedClean,
    CompletedWithFindings,
    FailedTransient,
    FailedPermanent,
    TimedOut,
    SkippedAlreadyDone,
}

impl ScanStatus {
    /// Success states are the ones recorded in the progress store.
    pub fn is_success(self) -> bool {
        matches!(
            self,
            ScanStatus::CompletedClean
                | ScanStatus::CompletedWithFindings
                | ScanStatus::SkippedAlreadyDone
        )
    }
}

impl std::fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ScanStatus::CompletedClean => "clean",
            ScanStatus::CompletedWithFindings => "findings",
            ScanStatus::FailedTransient => "failed (transient)",
            ScanStatus::FailedPermanent => "failed",
            ScanStatus::TimedOut => "timed out",
            ScanStatus::SkippedAlreadyDone => "skipped (already done)",
        };
        f.write_str(name)
    }
}

/// Failure taxonomy; the names are stable identifiers used in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Prepare,
    Fetch,
    DetectTimeout,
    DetectFailure,
    Parse,
    Publish,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Prepare => "prepare",
            ErrorKind::Fetch => "fetch",
            ErrorKind::DetectTimeout => "detect-timeout",
            ErrorKind::DetectFailure => "detect-failure",
            ErrorKind::Parse => "parse",
            ErrorKind::Publish => "publish",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct ScanError {
    pub kind: ErrorKind,
    pub message: String,
}

impl std::fmt::Display for ScanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ScanError {}

/// What one scan task reports back to the pool.
#[derive(Debug)]
pub struct Outcome {
    pub key: String,
    pub organization: String,
    pub status: ScanStatus,
    pub findings: Vec<Finding>,
    pub elapsed: Duration,
    pub retries: u32,
    pub error: Option<ScanError>,
    /// Where Publish placed the findings, when there were any.
    pub artifact: Option<PathBuf>,
}

impl Outcome {
    pub fn skipped(target: &Target) -> Outcome {
        Outcome {
            key: target.canonical_key(),
            organization: target.organization().to_string(),
            status: ScanStatus::SkippedAlreadyDone,
            findings: Vec::new(),
            elapsed: Duration::ZERO,
            retries: 0,
            error: None,
            artifact: None,
        }
    }
}

struct TaskSuccess {
    status: ScanStatus,
    findings: Vec<Finding>,
    retries: u32,
    artifact: Option<PathBuf>,
}

struct TaskFailure {
    status: ScanStatus,
    kind: ErrorKind,
    message: String,
    retries: u32,
}

impl TaskFailure {
    fn permanent(kind: ErrorKind, message: String, retries: u32) -> TaskFailure {
        TaskFailure {
            status: ScanStatus::FailedPermanent,
            kind,
            message,
            retries,
        }
    }

    /// Hard-deadline breach or shutdown, depending on which fired.
    fn cancelled(cancel: &CancelToken, kind: ErrorKind, retries: u32) -> TaskFailure {
        if cancel.shutdown_requested() {
            TaskFailure {
                status: ScanStatus::FailedTransient,
                kind,
                message: "cancelled by shutdown".to_string(),
                retries,
            }
        } else {
            TaskFailure {
                status: ScanStatus::TimedOut,
                kind: ErrorKind::DetectTimeout,
                message: "hard wall-clock ceiling exceeded".to_string(),
                retries,
            }
        }
    }
}

/// Run the full state machine for one target. Never panics outward; every
/// exit path destroys the workspace first.
pub fn run_scan_task(target: &Target, config: &RunConfig, cancel: &CancelToken) -> Outcome {
    let started = Instant::now();
    let key = target.canonical_key();
    let organization = target.organization().to_string();

    // Prepare
    let ws = match Workspace::create() {
        Ok(ws) => ws,
        Err(e) => {
            return Outcome {
                key,
                organization,
                status: ScanStatus::FailedTransient,
                findings: Vec::new(),
                elapsed: started.elapsed(),
                retries: 0,
                error: Some(ScanError {
                    kind: ErrorKind::Prepare,
                    message: format!("workspace allocation failed: {e}"),
                }),
                artifact: None,
            };
        }
    };

    let result = execute(target, config, cancel, &ws, &key);

    // Cleanup, with debug retention first. Guaranteed on the unwind path by
    // the TempDir guard inside Workspace.
    if config.debug {
        retain_debug_logs(&ws, config, &key);
    }
    ws.destroy();

    match result {
        Ok(success) => Outcome {
            key,
            organization,
            status: success.status,
            findings: success.findings,
            elapsed: started.elapsed(),
            retries: success.retries,
            error: None,
            artifact: success.artifact,
        },
        Err(failure) => Outcome {
            key,
            organization,
            status: failure.status,
            findings: Vec::new(),
            elapsed: started.elapsed(),
            retries: failure.retries,
            error: Some(ScanError {
                kind: failure.kind,
                message: failure.message,
            }),
            artifact: None,
        },
    }
}

/// Fetch → Budget → Detect → Parse → Publish, inside a live workspace.
fn execute(
    target: &Target,
    config: &RunConfig,
    cancel: &CancelToken,
    ws: &Workspace,
    key: &str,
) -> Result<TaskSuccess, TaskFailure> {
    // Fetch
    let repo_dir = ws.repo_dir();
    let url = target
        .repository_url(&config.clone_base)
        .ok_or_else(|| {
            TaskFailure::permanent(
                ErrorKind::Fetch,
                "organization targets are expanded by the source, not fetched".to_string(),
                0,
            )
        })?;

    git::clone_repository(&url, &repo_dir, config.git_timeout, cancel)
        .map_err(|e| git_failure(e, cancel))?;

    let scanned_commit = match target.pinned_commit() {
        Some(sha) => {
            // Dangling commits are unreachable from every ref; the clone
            // alone does not bring them down.
            if !git::has_object(&repo_dir, sha, cancel) {
                git::fetch_commit(&repo_dir, sha, config.git_timeout, cancel)
                    .map_err(|e| git_failure(e, cancel))?;
            }
            git::checkout_commit(&repo_dir, sha, config.git_timeout, cancel)
                .map_err(|e| git_failure(e, cancel))?;
            sha.to_string()
        }
        None => git::head_commit(&repo_dir, cancel).unwrap_or_else(|| "HEAD".to_string()),
    };

    // Budget
    let profile = budget::measure(&repo_dir);
    log::debug!(
        "{key}: {} bytes, {} files on disk",
        profile.size_bytes,
        profile.file_count
    );

    // Detect
    let variants = detector::command_variants(&config.detector, &repo_dir);
    let stdout_path = ws.detector_stdout_path();
    let mut timeout_attempts: u32 = 0;
    let mut variant_idx = 0;
    loop {
        let attempt = timeout_attempts + 1;
        let attempt_budget =
            budget::adaptive_timeout(profile, config.base_timeout, config.max_timeout, attempt);

        let run = detector::run_variant(&variants[variant_idx], &stdout_path, attempt_budget, cancel, key)
            .map_err(|e| {
                TaskFailure::permanent(
                    ErrorKind::DetectFailure,
                    format!("could not invoke detector: {e}"),
                    timeout_attempts,
                )
            })?;

        match run {
            detector::DetectorRun::Exited { success: true, stderr, .. } => {
                let _ = std::fs::write(ws.detector_stderr_path(), &stderr);
                break;
            }
            detector::DetectorRun::Exited { code, success: false, stderr } => {
                let _ = std::fs::write(ws.detector_stderr_path(), &stderr);
                log::warn!(
                    "{key}: detector variant {} exited with {:?}, trying next variant",
                    variant_idx + 1,
                    code
                );
                variant_idx += 1;
                if variant_idx >= variants.len() {
                    return Err(TaskFailure::permanent(
                        ErrorKind::DetectFailure,
                        format!(
                            "all {} detector variants failed; last stderr: {}",
                            variants.len(),
                            tail(&stderr)
                        ),
                        timeout_attempts,
                    ));
                }
            }
            detector::DetectorRun::TimedOut => {
                timeout_attempts += 1;
                log::warn!(
                    "{key}: detector timed out after {}s (attempt {attempt}/{})",
                    attempt_budget.as_secs(),
                    config.max_retries
                );
                if timeout_attempts >= config.max_retries {
                    return Err(TaskFailure {
                        status: ScanStatus::TimedOut,
                        kind: ErrorKind::DetectTimeout,
                        message: format!(
                            "detector exceeded its budget on all {} attempts",
                            config.max_retries
                        ),
                        retries: timeout_attempts,
                    });
                }
            }
            detector::DetectorRun::Cancelled => {
                return Err(TaskFailure::cancelled(cancel, ErrorKind::DetectTimeout, timeout_attempts));
            }
        }
    }

    // Parse
    let ctx = ScanContext {
        organization: target.organization().to_string(),
        repository_url: url,
        scanned_commit,
        scan_timestamp: Utc::now(),
    };
    let summary = findings::parse_detector_output(&stdout_path, &ctx).map_err(|e| {
        TaskFailure::permanent(
            ErrorKind::Parse,
            format!("could not read detector output: {e}"),
            timeout_attempts,
        )
    })?;
    if summary.dropped_unverified > 0 {
        log::debug!("{key}: dropped {} unverified records", summary.dropped_unverified);
    }

    if summary.findings.is_empty() {
        if summary.total_lines > 0 && summary.parsed == 0 {
            // Nothing machine-readable came back; keep the raw output
            let raw = findings::preserve_raw(&stdout_path, &config.results_dir, key);
            if summary.textual_hint {
                match raw {
                    Ok(path) => log::warn!(
                        "{key}: detector reported secrets in textual form only; raw output kept at {}",
                        path.display()
                    ),
                    Err(e) => log::warn!("{key}: could not preserve raw detector output: {e}"),
                }
                return Ok(TaskSuccess {
                    status: ScanStatus::CompletedClean,
                    findings: Vec::new(),
                    retries: timeout_attempts,
                    artifact: None,
                });
            }
            let preserved = raw
                .map(|p| format!("raw output preserved at {}", p.display()))
                .unwrap_or_else(|e| format!("raw output could not be preserved: {e}"));
            return Err(TaskFailure::permanent(
                ErrorKind::Parse,
                format!("all detector output was unparseable; {preserved}"),
                timeout_attempts,
            ));
        }
        return Ok(TaskSuccess {
            status: ScanStatus::CompletedClean,
            findings: Vec::new(),
            retries: timeout_attempts,
            artifact: None,
        });
    }

    // Publish
    let artifact = findings::publish(
        &summary.findings,
        &ctx.organization,
        &config.results_dir,
        Utc::now().date_naive(),
    )
    .map_err(|e| TaskFailure::permanent(ErrorKind::Publish, e.to_string(), timeout_attempts))?;

    Ok(TaskSuccess {
        status: ScanStatus::CompletedWithFindings,
        findings: summary.findings,
        retries: timeout_attempts,
        artifact: Some(artifact),
    })
}

fn git_failure(error: GitError, cancel: &CancelToken) -> TaskFailure {
    match error {
        GitError::Cancelled => TaskFailure::cancelled(cancel, ErrorKind::Fetch, 0),
        other => TaskFailure::permanent(ErrorKind::Fetch, other.to_string(), 0),
    }
}

/// In debug mode the detector's stdout/stderr survive the workspace.
fn retain_debug_logs(ws: &Workspace, config: &RunConfig, key: &str) {
    let dir = config.results_dir.join("logs").join(key.replace(['/', '@'], "-"));
    if let Err(e) = std::fs::create_dir_all(&dir) {
        log::warn!("{key}: could not create debug log dir: {e}");
        return;
    }
    for (src, name) in [
        (ws.detector_stdout_path(), "detector.out"),
        (ws.detector_stderr_path(), "detector.err"),
    ] {
        if src.exists()
            && let Err(e) = std::fs::copy(&src, dir.join(name))
        {
            log::warn!("{key}: could not retain {name}: {e}");
        }
    }
}

fn tail(s: &str) -> String {
    let lines: Vec<&str> = s.lines().rev().take(3).collect();
    lines.into_iter().rev().collect::<Vec<_>>().join(" / ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Cli;
    use clap::Parser;
    use std::path::Path;
    use std::process::Command;

    /// Build a config whose detector is a shell script we control.
    fn config_with_detector(dir: &Path, script: &str) -> RunConfig {
        let detector = dir.join("fake-detector");
        std::fs::write(&detector, format!("#!/bin/sh\n{script}\n")).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&detector, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let results = dir.join("results");
        let cli = Cli::try_parse_from([
            "revenant",
            "acme/app",
            "--results-dir",
            results.to_str().unwrap(),
        ])
        .unwrap();
        let mut config = RunConfig::resolve(&cli).unwrap();
        config.detector.program = detector;
        config.detector.extra_args = Vec::new();
        config.clone_base = format!("file://{}", dir.join("fixtures").display());
        config
    }

    fn fixture_repo(dir: &Path) {
        let repo = dir.join("fixtures").join("acme").join("app");
        std::fs::create_dir_all(&repo).unwrap();
        let run = |args: &[&str]| {
            let output = Command::new("git")
                .args(args)
                .current_dir(&repo)
                .env("GIT_AUTHOR_NAME", "t")
                .env("GIT_AUTHOR_EMAIL", "t@example.com")
                .env("GIT_COMMITTER_NAME", "t")
                .env("GIT_COMMITTER_EMAIL", "t@example.com")
                .output()
                .expect("git runs");
            assert!(output.status.success(), "git {args:?} failed: {output:?}");
        };
        run(&["init", "-q", "-b", "main"]);
        std::fs::write(repo.join("config.py"), "AWS_KEY = 'AKIA1234'\n").unwrap();
        run(&["add", "."]);
        run(&["commit", "-q", "-m", "add config"]);
    }

    fn target() -> Target {
        Target::parse_spec("acme/app").unwrap()
    }

    #[test]
    fn test_clean_scan() {
        let dir = tempfile::tempdir().unwrap();
        fixture_repo(dir.path());
        let config = config_with_detector(dir.path(), "exit 0");

        let outcome = run_scan_task(&target(), &config, &CancelToken::unbounded());
        assert_eq!(outcome.status, ScanStatus::CompletedClean, "{:?}", outcome.error);
        assert_eq!(outcome.retries, 0);
        assert!(outcome.findings.is_empty());
        assert!(outcome.artifact.is_none());
    }

    #[test]
    fn test_scan_with_verified_findings_publishes() {
        let dir = tempfile::tempdir().unwrap();
        fixture_repo(dir.path());
        let record = r#"{\"DetectorName\":\"AWS\",\"Verified\":true,\"Raw\":\"AKIA1234\"}"#;
        let config = config_with_detector(dir.path(), &format!("echo \"{record}\""));

        let outcome = run_scan_task(&target(), &config, &CancelToken::unbounded());
        assert_eq!(outcome.status, ScanStatus::CompletedWithFindings, "{:?}", outcome.error);
        assert_eq!(outcome.findings.len(), 1);

        let artifact = outcome.artifact.expect("artifact path");
        assert!(artifact.ends_with("acme/verified_secrets_acme.json"));
        let records: Vec<serde_json::Value> =
            serde_json::from_str(&std::fs::read_to_string(&artifact).unwrap()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["organization"], "acme");
        assert_eq!(records[0]["Verified"], true);
    }

    #[test]
    fn test_unverified_findings_are_clean() {
        let dir = tempfile::tempdir().unwrap();
        fixture_repo(dir.path());
        let record = r#"{\"DetectorName\":\"AWS\",\"Verified\":false,\"Raw\":\"AKIA1234\"}"#;
        let config = config_with_detector(dir.path(), &format!("echo \"{record}\""));

        let outcome = run_scan_task(&target(), &config, &CancelToken::unbounded());
        assert_eq!(outcome.status, ScanStatus::CompletedClean);
        assert!(outcome.artifact.is_none());
    }

    #[test]
    fn test_all_variants_failing_is_detect_failure() {
        let dir = tempfile::tempdir().unwrap();
        fixture_repo(dir.path());
        let config = config_with_detector(dir.path(), "echo broken >&2; exit 3");

        let outcome = run_scan_task(&target(), &config, &CancelToken::unbounded());
        assert_eq!(outcome.status, ScanStatus::FailedPermanent);
        let error = outcome.error.expect("error");
        assert_eq!(error.kind, ErrorKind::DetectFailure);
        assert!(error.message.contains("broken"));
    }

    #[test]
    fn test_unparseable_output_is_parse_failure_with_raw_preserved() {
        let dir = tempfile::tempdir().unwrap();
        fixture_repo(dir.path());
        let config =
            config_with_detector(dir.path(), "echo 'scanner noise without structure'");

        let outcome = run_scan_task(&target(), &config, &CancelToken::unbounded());
        assert_eq!(outcome.status, ScanStatus::FailedPermanent);
        assert_eq!(outcome.error.as_ref().unwrap().kind, ErrorKind::Parse);
        let raw = config.results_dir.join("raw").join("acme-app.out");
        assert!(raw.exists());
    }

    #[test]
    fn test_textual_hint_is_clean_with_raw_preserved() {
        let dir = tempfile::tempdir().unwrap();
        fixture_repo(dir.path());
        let config = config_with_detector(dir.path(), "echo 'Found verified result: AWS'");

        let outcome = run_scan_task(&target(), &config, &CancelToken::unbounded());
        assert_eq!(outcome.status, ScanStatus::CompletedClean);
        assert!(config.results_dir.join("raw").join("acme-app.out").exists());
    }

    #[test]
    fn test_fetch_failure_is_permanent() {
        let dir = tempfile::tempdir().unwrap();
        // No fixture repo created: the clone fails
        let config = config_with_detector(dir.path(), "exit 0");

        let outcome = run_scan_task(&target(), &config, &CancelToken::unbounded());
        assert_eq!(outcome.status, ScanStatus::FailedPermanent);
        assert_eq!(outcome.error.unwrap().kind, ErrorKind::Fetch);
    }

    #[test]
    fn test_shutdown_cancellation_is_transient_and_unrecorded_status() {
        let dir = tempfile::tempdir().unwrap();
        fixture_repo(dir.path());
        let config = config_with_detector(dir.path(), "sleep 30");

        let shutdown = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(true));
        let cancel = CancelToken::new(shutdown, None);
        let outcome = run_scan_task(&target(), &config, &cancel);
        assert_eq!(outcome.status, ScanStatus::FailedTransient);
        assert!(!outcome.status.is_success());
    }
}
