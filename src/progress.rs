//! Durable, crash-safe record of completed targets.
//!
//! The on-disk document is an external interface consumed by resume logic
//! and operators alike; its schema does not change. Every mutation rewrites
//! the file through a sibling temp file and an atomic rename, so a crash can
//! only ever leave the previous complete document behind, never a torn one.
//!
//! Only the pool's outcome loop holds the store, which gives a total order
//! over appends without any locking.

use chrono::{DateTime, Utc};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::config::RunConfig;
use crate::scan::ScanStatus;

/// The progress document. Field names are part of the file format.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScanState {
    pub start_time: DateTime<Utc>,
    pub results_dir: PathBuf,
    /// Target population observed when the run started.
    pub total_orgs: u64,
    /// Canonical keys in terminal success state, in completion order.
    pub scanned_orgs: IndexSet<String>,
    pub last_updated: DateTime<Utc>,
    pub configuration: StateConfig,
}

/// The slice of the run configuration frozen into the document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateConfig {
    pub order: String,
    pub workers: usize,
    pub source: String,
}

#[derive(Debug)]
pub enum ProgressError {
    /// The file exists but does not parse; the user must repair or --restart.
    Corrupt { path: PathBuf, detail: String },
    Io { path: PathBuf, detail: String },
}

impl std::fmt::Display for ProgressError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProgressError::Corrupt { path, detail } => {
                write!(
                    f,
                    "progress store {} is corrupt: {detail} (repair it or rerun with --restart)",
                    path.display()
                )
            }
            ProgressError::Io { path, detail } => {
                write!(f, "progress store {}: {detail}", path.display())
            }
        }
    }
}

impl std::error::Error for ProgressError {}

#[derive(Debug)]
pub enum LoadOutcome {
    Loaded(ScanState),
    NotFound,
}

pub struct ProgressStore {
    path: PathBuf,
    state: ScanState,
}

impl ProgressStore {
    /// Read an existing document. Absence means "fresh run"; a present but
    /// unparseable file is a hard error, never silently discarded.
    pub fn load(path: &Path) -> Result<LoadOutcome, ProgressError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LoadOutcome::NotFound),
            Err(e) => {
                return Err(ProgressError::Io {
                    path: path.to_path_buf(),
                    detail: e.to_string(),
                });
            }
        };
        let state: ScanState =
            serde_json::from_str(&content).map_err(|e| ProgressError::Corrupt {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })?;
        Ok(LoadOutcome::Loaded(state))
    }

    /// Write the initial document for a fresh run.
    pub fn initialize(
        path: &Path,
        config: &RunConfig,
        total: usize,
    ) -> Result<ProgressStore, ProgressError> {
        let now = Utc::now();
        let store = ProgressStore {
            path: path.to_path_buf(),
            state: ScanState {
                start_time: now,
                results_dir: config.results_dir.clone(),
                total_orgs: total as u64,
                scanned_orgs: IndexSet::new(),
                last_updated: now,
                configuration: StateConfig {
                    order: config.order.to_string(),
                    workers: config.workers,
                    source: config.source.describe(),
                },
            },
        };
        store.persist()?;
        Ok(store)
    }

    /// Adopt a previously-loaded document for a resumed run.
    pub fn resume(path: &Path, state: ScanState) -> ProgressStore {
        ProgressStore {
            path: path.to_path_buf(),
            state,
        }
    }

    /// Remove the document for --restart. Missing file is fine.
    pub fn delete(path: &Path) -> Result<(), ProgressError> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ProgressError::Io {
                path: path.to_path_buf(),
                detail: e.to_string(),
            }),
        }
    }

    /// Append a key to the success set and persist atomically. Callers only
    /// invoke this after the target's outputs are durably in place.
    pub fn record_done(&mut self, key: &str, status: ScanStatus) -> Result<(), ProgressError> {
        log::debug!("recording {key} as done ({status})");
        self.state.scanned_orgs.insert(key.to_string());
        self.state.last_updated = Utc::now();
        self.persist()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state.scanned_orgs.contains(key)
    }

    pub fn scanned(&self) -> &IndexSet<String> {
        &self.state.scanned_orgs
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self) -> Result<(), ProgressError> {
        let io_err = |detail: String| ProgressError::Io {
            path: self.path.to_path_buf(),
            detail,
        };

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| io_err(e.to_string()))?;
        }

        let json =
            serde_json::to_string_pretty(&self.state).map_err(|e| io_err(e.to_string()))?;

        // Sibling temp + rename: the document is either the old complete
        // state or the new complete state, never a prefix.
        let tmp = self.path.with_extension("json.tmp");
        let mut file = std::fs::File::create(&tmp).map_err(|e| io_err(e.to_string()))?;
        file.write_all(json.as_bytes()).map_err(|e| io_err(e.to_string()))?;
        file.sync_all().map_err(|e| io_err(e.to_string()))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| io_err(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Cli;
    use clap::Parser;

    fn test_config(dir: &Path) -> RunConfig {
        let cli = Cli::try_parse_from([
            "revenant",
            "acme/app@deadbeef",
            "--results-dir",
            dir.to_str().unwrap(),
        ])
        .unwrap();
        RunConfig::resolve(&cli).unwrap()
    }

    #[test]
    fn test_load_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = ProgressStore::load(&dir.path().join("scan_state.json")).unwrap();
        assert!(matches!(outcome, LoadOutcome::NotFound));
    }

    #[test]
    fn test_initialize_record_reload() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let path = config.state_file.clone();

        let mut store = ProgressStore::initialize(&path, &config, 3).unwrap();
        store.record_done("acme/app@1", ScanStatus::CompletedClean).unwrap();
        store
            .record_done("acme/app@2", ScanStatus::CompletedWithFindings)
            .unwrap();
        assert!(store.contains("acme/app@1"));
        assert!(!store.contains("acme/app@3"));

        // No temp residue after the atomic rename
        assert!(!path.with_extension("json.tmp").exists());

        let LoadOutcome::Loaded(state) = ProgressStore::load(&path).unwrap() else {
            panic!("expected document");
        };
        assert_eq!(state.total_orgs, 3);
        let keys: Vec<&String> = state.scanned_orgs.iter().collect();
        assert_eq!(keys, ["acme/app@1", "acme/app@2"]);
        assert_eq!(state.configuration.source, "single:acme/app@deadbeef");
    }

    #[test]
    fn test_corrupt_file_is_reported_not_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan_state.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = ProgressStore::load(&path).unwrap_err();
        assert!(matches!(err, ProgressError::Corrupt { .. }));
        assert!(err.to_string().contains("scan_state.json"));
        // Still on disk
        assert!(path.exists());
    }

    #[test]
    fn test_document_roundtrip_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let path = config.state_file.clone();
        let mut store = ProgressStore::initialize(&path, &config, 1).unwrap();
        store.record_done("acme/app@1", ScanStatus::CompletedClean).unwrap();

        let on_disk = std::fs::read_to_string(&path).unwrap();
        let parsed: ScanState = serde_json::from_str(&on_disk).unwrap();
        let reserialized = serde_json::to_string_pretty(&parsed).unwrap();
        assert_eq!(on_disk, reserialized);
    }

    #[test]
    fn test_delete_tolerates_missing() {
        let dir = tempfile::tempdir().unwrap();
        ProgressStore::delete(&dir.path().join("scan_state.json")).unwrap();
    }
}
