//! Per-target workspace lifecycle.
//!
//! A workspace is the scratch directory one target is fetched into. It is
//! owned by exactly one worker and destroyed on every exit path; the RAII
//! guard covers unwinds, and [`Workspace::destroy`] covers the normal path
//! with error logging (cleanup failures never mask the task outcome).

use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub struct Workspace {
    id: String,
    dir: TempDir,
}

impl Workspace {
    /// Allocate a fresh workspace under the system temp directory. Creation
    /// failing is also the writability precondition check for the host.
    pub fn create() -> std::io::Result<Workspace> {
        let dir = TempDir::with_prefix(format!("revenant-{}-", std::process::id()))?;
        let id = dir
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "workspace".to_string());
        log::debug!("workspace {id} created at {}", dir.path().display());
        Ok(Workspace { id, dir })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Where the target's repository is cloned.
    pub fn repo_dir(&self) -> PathBuf {
        self.dir.path().join("repo")
    }

    /// Detector stdout is streamed here rather than held in memory.
    pub fn detector_stdout_path(&self) -> PathBuf {
        self.dir.path().join("detector.out")
    }

    /// Captured detector stderr from the most recent attempt.
    pub fn detector_stderr_path(&self) -> PathBuf {
        self.dir.path().join("detector.err")
    }

    /// Explicit removal with logging. The Drop impl of the inner TempDir is
    /// the backstop for unwind paths.
    pub fn destroy(self) {
        let id = self.id.clone();
        if let Err(e) = self.dir.close() {
            log::warn!("workspace {id} cleanup failed: {e}");
        } else {
            log::debug!("workspace {id} removed");
        }
    }
}

/// Remove workspaces orphaned by prior runs whose process is gone.
pub fn sweep_orphans() {
    let tmp = std::env::temp_dir();
    let entries = match std::fs::read_dir(&tmp) {
        Ok(entries) => entries,
        Err(e) => {
            log::debug!("orphan sweep skipped: {e}");
            return;
        }
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let Some(rest) = name.strip_prefix("revenant-") else {
            continue;
        };
        let Some(pid) = rest.split('-').next().and_then(|p| p.parse::<u32>().ok()) else {
            continue;
        };
        if pid == std::process::id() || process_alive(pid) {
            continue;
        }
        match std::fs::remove_dir_all(entry.path()) {
            Ok(()) => log::info!("removed orphaned workspace {name}"),
            Err(e) => log::warn!("could not remove orphaned workspace {name}: {e}"),
        }
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    // Signal 0 probes existence without delivering anything
    !matches!(
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None),
        Err(nix::errno::Errno::ESRCH)
    )
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    // Without a cheap probe, leave directories in place
    true
}
