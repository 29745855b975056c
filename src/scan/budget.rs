//! Adaptive detector timeout derived from measured repository shape.
//!
//! Budgets scale with what is actually on disk after the fetch, not with
//! size hints from the dataset: the detector walks full git history, so a
//! small checkout with a heavy `.git` still needs the larger budget.

use ignore::WalkBuilder;
use std::path::Path;
use std::time::Duration;

/// Above this on-disk size the budget doubles.
const LARGE_REPO_BYTES: u64 = 500 * 1024 * 1024;
/// Above this on-disk size the budget grows by half.
const MEDIUM_REPO_BYTES: u64 = 100 * 1024 * 1024;
/// Above this many working-tree files the budget grows by 1.3x.
const MANY_FILES: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepoProfile {
    /// Total bytes under the workspace repo, `.git` included.
    pub size_bytes: u64,
    /// Working-tree files, `.git` excluded.
    pub file_count: u64,
}

/// Walk the fetched repository and measure it.
pub fn measure(repo_dir: &Path) -> RepoProfile {
    let walker = WalkBuilder::new(repo_dir)
        .hidden(false)
        .ignore(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .build();

    let mut size_bytes = 0u64;
    let mut file_count = 0u64;
    for entry in walker.flatten() {
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }
        size_bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
        let in_git_dir = entry
            .path()
            .strip_prefix(repo_dir)
            .ok()
            .is_some_and(|rel| rel.components().any(|c| c.as_os_str() == ".git"));
        if !in_git_dir {
            file_count += 1;
        }
    }
    RepoProfile { size_bytes, file_count }
}

/// Budget for a given attempt (1-based): base x size factor x file factor x
/// attempt, capped at `max`.
pub fn adaptive_timeout(
    profile: RepoProfile,
    base: Duration,
    max: Duration,
    attempt: u32,
) -> Duration {
    let mut secs = base.as_secs_f64();

    if profile.size_bytes > LARGE_REPO_BYTES {
        secs *= 2.0;
    } else if profile.size_bytes > MEDIUM_REPO_BYTES {
        secs *= 1.5;
    }
    if profile.file_count > MANY_FILES {
        secs *= 1.3;
    }
    secs *= f64::from(attempt.max(1));

    Duration::from_secs_f64(secs).min(max)
}
