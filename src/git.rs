//! Git operations for fetching scan targets into workspaces.
//!
//! Everything shells out to the `git` binary through [`crate::exec`], so
//! each operation carries the run's git timeout and the task's cancel token.
//! Clones of dangling commits rely on the host allowing `fetch` by raw SHA
//! (GitHub keeps unreachable objects servable for a long window).

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use crate::exec::{self, CancelToken};

/// Transient network failures get one internal retry before giving up.
const FETCH_ATTEMPTS: u32 = 2;

#[derive(Debug)]
pub enum GitError {
    CloneFailed { url: String, detail: String },
    FetchFailed { object: String, detail: String },
    CheckoutFailed { object: String, detail: String },
    /// The git binary itself could not be started.
    Spawn { detail: String },
    /// The operation exceeded the git timeout.
    Timeout { operation: &'static str },
    /// Shutdown or the hard deadline cancelled the operation mid-flight.
    Cancelled,
}

impl std::fmt::Display for GitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GitError::CloneFailed { url, detail } => {
                write!(f, "clone of {url} failed: {detail}")
            }
            GitError::FetchFailed { object, detail } => {
                write!(f, "fetch of {object} failed: {detail}")
            }
            GitError::CheckoutFailed { object, detail } => {
                write!(f, "checkout of {object} failed: {detail}")
            }
            GitError::Spawn { detail } => write!(f, "git could not be executed: {detail}"),
            GitError::Timeout { operation } => write!(f, "git {operation} timed out"),
            GitError::Cancelled => write!(f, "git operation cancelled"),
        }
    }
}

impl std::error::Error for GitError {}

/// Build a git command with credential prompts and LFS smudging disabled.
/// A scanner must never hang waiting for a username on a deleted repo.
fn git_command(args: &[&str], dir: Option<&Path>) -> Command {
    let mut cmd = Command::new("git");
    cmd.args(args)
        .env("GIT_TERMINAL_PROMPT", "0")
        .env("GIT_LFS_SKIP_SMUDGE", "1");
    if let Some(dir) = dir {
        cmd.current_dir(dir);
    }
    cmd
}

fn run_git(
    args: &[&str],
    dir: Option<&Path>,
    timeout: Duration,
    cancel: &CancelToken,
    context: &str,
    operation: &'static str,
) -> Result<std::process::Output, GitError> {
    let mut cmd = git_command(args, dir);
    match exec::run_captured(&mut cmd, Some(context), timeout, cancel) {
        Ok(output) => Ok(output),
        Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
            Err(GitError::Timeout { operation })
        }
        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => Err(GitError::Cancelled),
        Err(e) => Err(GitError::Spawn { detail: e.to_string() }),
    }
}

fn stderr_tail(output: &std::process::Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let tail: Vec<&str> = stderr.lines().rev().take(3).collect();
    tail.into_iter().rev().collect::<Vec<_>>().join(" / ")
}

/// Clone `url` into `dest`. Retries once on failure unless cancelled.
pub fn clone_repository(
    url: &str,
    dest: &Path,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<(), GitError> {
    let dest_str = dest.display().to_string();
    let mut last_detail = String::new();
    for attempt in 1..=FETCH_ATTEMPTS {
        let output = run_git(
            &["clone", "--quiet", url, dest_str.as_str()],
            None,
            timeout,
            cancel,
            url,
            "clone",
        )?;
        if output.status.success() {
            return Ok(());
        }
        last_detail = stderr_tail(&output);
        log::debug!("clone attempt {attempt}/{FETCH_ATTEMPTS} of {url} failed: {last_detail}");
        if cancel.shutdown_requested() || cancel.deadline_exceeded() {
            return Err(GitError::Cancelled);
        }
        // A partially-written clone dir makes the retry fail outright
        if dest.exists() {
            let _ = std::fs::remove_dir_all(dest);
        }
    }
    Err(GitError::CloneFailed {
        url: url.to_string(),
        detail: last_detail,
    })
}

/// Fetch a specific object by SHA, which is how dangling commits are
/// materialized: they are unreachable from every ref, so the clone alone
/// never brings them down.
pub fn fetch_commit(
    repo_dir: &Path,
    sha: &str,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<(), GitError> {
    let mut last_detail = String::new();
    for attempt in 1..=FETCH_ATTEMPTS {
        let output = run_git(
            &["fetch", "--quiet", "origin", sha],
            Some(repo_dir),
            timeout,
            cancel,
            sha,
            "fetch",
        )?;
        if output.status.success() {
            return Ok(());
        }
        last_detail = stderr_tail(&output);
        log::debug!("fetch attempt {attempt}/{FETCH_ATTEMPTS} of {sha} failed: {last_detail}");
        if cancel.shutdown_requested() || cancel.deadline_exceeded() {
            return Err(GitError::Cancelled);
        }
    }
    Err(GitError::FetchFailed {
        object: sha.to_string(),
        detail: last_detail,
    })
}

/// Detached checkout of a specific commit.
pub fn checkout_commit(
    repo_dir: &Path,
    sha: &str,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<(), GitError> {
    let output = run_git(
        &[
            "-c",
            "advice.detachedHead=false",
            "checkout",
            "--quiet",
            sha,
        ],
        Some(repo_dir),
        timeout,
        cancel,
        sha,
        "checkout",
    )?;
    if output.status.success() {
        return Ok(());
    }
    Err(GitError::CheckoutFailed {
        object: sha.to_string(),
        detail: stderr_tail(&output),
    })
}

/// The commit actually checked out, for attribution when the target did not
/// pin one.
pub fn head_commit(repo_dir: &Path, cancel: &CancelToken) -> Option<String> {
    run_git(
        &["rev-parse", "HEAD"],
        Some(repo_dir),
        Duration::from_secs(30),
        cancel,
        "HEAD",
        "rev-parse",
    )
    .ok()
    .filter(|o| o.status.success())
    .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
}

/// True when the object already exists locally (clone brought it down),
/// making the by-SHA fetch unnecessary.
pub fn has_object(repo_dir: &Path, sha: &str, cancel: &CancelToken) -> bool {
    run_git(
        &["cat-file", "-e", &format!("{sha}^{{commit}}")],
        Some(repo_dir),
        Duration::from_secs(30),
        cancel,
        sha,
        "cat-file",
    )
    .map(|o| o.status.success())
    .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    fn init_fixture_repo(dir: &Path) -> String {
        let run = |args: &[&str]| {
            let output = Command::new("git")
                .args(args)
                .current_dir(dir)
                .env("GIT_AUTHOR_NAME", "t")
                .env("GIT_AUTHOR_EMAIL", "t@example.com")
                .env("GIT_COMMITTER_NAME", "t")
                .env("GIT_COMMITTER_EMAIL", "t@example.com")
                .output()
                .expect("git runs");
            assert!(output.status.success(), "git {:?}: {:?}", args, output);
            String::from_utf8_lossy(&output.stdout).trim().to_string()
        };
        run(&["init", "-q", "-b", "main"]);
        std::fs::write(dir.join("file.txt"), "contents\n").unwrap();
        run(&["add", "."]);
        run(&["commit", "-q", "-m", "initial"]);
        run(&["rev-parse", "HEAD"])
    }

    #[test]
    fn test_clone_and_checkout_local_repo() {
        let fixture = tempfile::tempdir().unwrap();
        let sha = init_fixture_repo(fixture.path());

        let dest_root = tempfile::tempdir().unwrap();
        let dest = dest_root.path().join("repo");
        let cancel = CancelToken::unbounded();
        let url = format!("file://{}", fixture.path().display());

        clone_repository(&url, &dest, Duration::from_secs(60), &cancel).unwrap();
        assert!(dest.join("file.txt").exists());
        assert!(has_object(&dest, &sha, &cancel));
        checkout_commit(&dest, &sha, Duration::from_secs(60), &cancel).unwrap();
    }

    #[test]
    fn test_clone_nonexistent_fails() {
        let dest_root = tempfile::tempdir().unwrap();
        let dest = dest_root.path().join("repo");
        let err = clone_repository(
            "file:///nonexistent/nowhere",
            &dest,
            Duration::from_secs(30),
            &CancelToken::unbounded(),
        )
        .unwrap_err();
        assert!(matches!(err, GitError::CloneFailed { .. }));
    }
}
