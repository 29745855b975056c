//! The bounded-concurrency worker pool.
//!
//! N worker threads pull targets from a bounded channel and run the scan
//! task; outcomes flow back over a second channel to this thread, which is
//! the single serializing owner of the progress store and the notification
//! dispatcher. Shutdown signals stop dispatch immediately, cancel in-flight
//! tasks cooperatively (workers kill their detector process groups), and
//! leave in-flight targets unrecorded so a resumed run retries them.

use crossbeam_channel as chan;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::config::RunConfig;
use crate::exec::CancelToken;
use crate::notify::Dispatcher;
use crate::progress::ProgressStore;
use crate::scan::{self, Outcome, ScanStatus};
use crate::source::TargetStream;
use crate::styling::{
    ERROR_EMOJI, FINDINGS_EMOJI, SKIP_EMOJI, SUCCESS_EMOJI, TIMEOUT_EMOJI, WARNING_EMOJI, println,
};
use crate::target::Target;

/// No target runs longer than this, whatever its retry budgets say.
pub const HARD_TARGET_DEADLINE: Duration = Duration::from_secs(3600);

/// How long the feeder blocks on the task queue before re-checking shutdown.
const FEED_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub clean: usize,
    pub with_findings: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub skipped: usize,
    pub interrupted: bool,
}

impl RunSummary {
    /// Individual target failures do not fail the run; interruption maps to
    /// the conventional 128+SIGINT code.
    pub fn exit_code(&self) -> i32 {
        if self.interrupted { 130 } else { 0 }
    }
}

/// Drive the full target stream to completion (or interruption).
pub fn run(
    targets: TargetStream,
    config: &RunConfig,
    store: &mut ProgressStore,
    dispatcher: &mut Dispatcher,
) -> RunSummary {
    let shutdown = Arc::new(AtomicBool::new(false));
    register_signals(&shutdown);

    // Snapshot of already-done keys; the source guarantees within-run
    // uniqueness, this guarantees across-run uniqueness.
    let done: HashSet<String> = store.scanned().iter().cloned().collect();

    let (task_tx, task_rx) = chan::bounded::<Target>(config.workers * 2);
    let (outcome_tx, outcome_rx) = chan::unbounded::<Outcome>();

    let mut summary = RunSummary::default();

    std::thread::scope(|scope| {
        for worker_id in 0..config.workers {
            let task_rx = task_rx.clone();
            let outcome_tx = outcome_tx.clone();
            let shutdown = Arc::clone(&shutdown);
            scope.spawn(move || {
                while let Ok(target) = task_rx.recv() {
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    let key = target.canonical_key();
                    log::debug!("worker {worker_id} starts {key}");
                    let cancel = CancelToken::new(
                        Arc::clone(&shutdown),
                        Some(Instant::now() + HARD_TARGET_DEADLINE),
                    );
                    let outcome = scan::run_scan_task(&target, config, &cancel);
                    if outcome_tx.send(outcome).is_err() {
                        break;
                    }
                }
            });
        }
        drop(task_rx);

        let feeder_outcome_tx = outcome_tx.clone();
        drop(outcome_tx);
        let feeder_shutdown = Arc::clone(&shutdown);
        scope.spawn(move || {
            feed_targets(targets, task_tx, feeder_outcome_tx, &done, &feeder_shutdown);
        });

        // Sole consumer of outcomes: store appends are totally ordered here.
        for outcome in outcome_rx {
            apply_outcome(outcome, store, dispatcher, &mut summary);
        }
    });

    summary.interrupted = shutdown.load(Ordering::Relaxed);
    summary
}

/// Feed targets into the bounded queue, short-circuiting already-done keys
/// and stopping at the first shutdown observation.
fn feed_targets(
    targets: TargetStream,
    task_tx: chan::Sender<Target>,
    outcome_tx: chan::Sender<Outcome>,
    done: &HashSet<String>,
    shutdown: &AtomicBool,
) {
    for target in targets {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        if done.contains(&target.canonical_key()) {
            if outcome_tx.send(Outcome::skipped(&target)).is_err() {
                break;
            }
            continue;
        }

        let mut pending = target;
        loop {
            match task_tx.send_timeout(pending, FEED_POLL) {
                Ok(()) => break,
                Err(chan::SendTimeoutError::Timeout(back)) => {
                    if shutdown.load(Ordering::Relaxed) {
                        return;
                    }
                    pending = back;
                }
                Err(chan::SendTimeoutError::Disconnected(_)) => return,
            }
        }
    }
    // Dropping task_tx lets idle workers finish
}

fn apply_outcome(
    outcome: Outcome,
    store: &mut ProgressStore,
    dispatcher: &mut Dispatcher,
    summary: &mut RunSummary,
) {
    print_status_line(&outcome);

    match outcome.status {
        ScanStatus::CompletedClean => summary.clean += 1,
        ScanStatus::CompletedWithFindings => summary.with_findings += 1,
        ScanStatus::FailedTransient | ScanStatus::FailedPermanent => summary.failed += 1,
        ScanStatus::TimedOut => summary.timed_out += 1,
        ScanStatus::SkippedAlreadyDone => summary.skipped += 1,
    }

    // Notifications are queued before the key is recorded, so a crash
    // between the two re-runs the target rather than losing the alert.
    dispatcher.observe(&outcome);

    let newly_done = matches!(
        outcome.status,
        ScanStatus::CompletedClean | ScanStatus::CompletedWithFindings
    );
    if newly_done
        && let Err(e) = store.record_done(&outcome.key, outcome.status)
    {
        log::error!("could not record {} in the progress store: {e}", outcome.key);
    }
}

/// The one-line operator status per target.
fn print_status_line(outcome: &Outcome) {
    match outcome.status {
        ScanStatus::CompletedClean => {
            println!("{SUCCESS_EMOJI} {} clean ({:.0?})", outcome.key, outcome.elapsed);
        }
        ScanStatus::CompletedWithFindings => {
            println!(
                "{FINDINGS_EMOJI} {} {} verified finding(s) ({:.0?})",
                outcome.key,
                outcome.findings.len(),
                outcome.elapsed
            );
        }
        ScanStatus::FailedTransient | ScanStatus::FailedPermanent => {
            let emoji = if outcome.status == ScanStatus::FailedTransient {
                WARNING_EMOJI
            } else {
                ERROR_EMOJI
            };
            let detail = outcome
                .error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string());
            println!("{emoji} {} {detail}", outcome.key);
        }
        ScanStatus::TimedOut => {
            println!(
                "{TIMEOUT_EMOJI} {} timed out after {} attempt(s)",
                outcome.key,
                outcome.retries.max(1)
            );
        }
        ScanStatus::SkippedAlreadyDone => {
            println!("{SKIP_EMOJI} {} already scanned", outcome.key);
        }
    }
}

#[cfg(unix)]
fn register_signals(shutdown: &Arc<AtomicBool>) {
    use signal_hook::consts::{SIGINT, SIGTERM};
    for sig in [SIGINT, SIGTERM] {
        // First signal requests orderly shutdown; a second one falls through
        // to the default disposition and kills the process outright.
        if let Err(e) = signal_hook::flag::register_conditional_default(sig, Arc::clone(shutdown))
        {
            log::warn!("could not register conditional default for signal {sig}: {e}");
        }
        if let Err(e) = signal_hook::flag::register(sig, Arc::clone(shutdown)) {
            log::warn!("could not register handler for signal {sig}: {e}");
        }
    }
}

#[cfg(not(unix))]
fn register_signals(_shutdown: &Arc<AtomicBool>) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Cli;
    use crate::target::CommitTarget;
    use clap::Parser;
    use std::path::Path;
    use std::process::Command;

    fn fixture_repo(root: &Path, org: &str, repo: &str) -> String {
        let dir = root.join("fixtures").join(org).join(repo);
        std::fs::create_dir_all(&dir).unwrap();
        let run = |args: &[&str]| {
            let output = Command::new("git")
                .args(args)
                .current_dir(&dir)
                .env("GIT_AUTHOR_NAME", "t")
                .env("GIT_AUTHOR_EMAIL", "t@example.com")
                .env("GIT_COMMITTER_NAME", "t")
                .env("GIT_COMMITTER_EMAIL", "t@example.com")
                .output()
                .expect("git runs");
            assert!(output.status.success(), "git {args:?} failed: {output:?}");
            String::from_utf8_lossy(&output.stdout).trim().to_string()
        };
        run(&["init", "-q", "-b", "main"]);
        std::fs::write(dir.join("app.py"), "print('hi')\n").unwrap();
        run(&["add", "."]);
        run(&["commit", "-q", "-m", "initial"]);
        run(&["rev-parse", "HEAD"])
    }

    fn test_config(dir: &Path, detector_script: &str, workers: usize) -> RunConfig {
        let detector = dir.join("fake-detector");
        std::fs::write(&detector, format!("#!/bin/sh\n{detector_script}\n")).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&detector, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let results = dir.join("results");
        let cli = Cli::try_parse_from([
            "revenant",
            "acme",
            "--events-file",
            "unused.csv",
            "--results-dir",
            results.to_str().unwrap(),
            "--workers",
            &workers.to_string(),
        ])
        .unwrap();
        let mut config = RunConfig::resolve(&cli).unwrap();
        config.detector.program = detector;
        config.detector.extra_args = Vec::new();
        config.clone_base = format!("file://{}", dir.join("fixtures").display());
        config
    }

    fn commit_target(org: &str, repo: &str, sha: &str) -> Target {
        Target::Commit(CommitTarget {
            organization: org.to_string(),
            repository: repo.to_string(),
            commit: sha.to_string(),
            before_commit: None,
            stars: None,
            pushed_at: None,
        })
    }

    #[test]
    fn test_pool_completes_targets_and_records_them() {
        let dir = tempfile::tempdir().unwrap();
        let sha_a = fixture_repo(dir.path(), "acme", "app");
        let sha_b = fixture_repo(dir.path(), "acme", "lib");
        let config = test_config(dir.path(), "exit 0", 2);

        let targets = vec![
            commit_target("acme", "app", &sha_a),
            commit_target("acme", "lib", &sha_b),
        ];
        let stream = TargetStream::from_vec(targets);
        let mut store = ProgressStore::initialize(&config.state_file, &config, 2).unwrap();
        let mut dispatcher = Dispatcher::new(Vec::new());

        let summary = run(stream, &config, &mut store, &mut dispatcher);
        assert_eq!(summary.clean, 2);
        assert_eq!(summary.failed, 0);
        assert!(!summary.interrupted);
        assert_eq!(summary.exit_code(), 0);

        assert!(store.contains(&format!("acme/app@{sha_a}")));
        assert!(store.contains(&format!("acme/lib@{sha_b}")));
    }

    #[test]
    fn test_pool_skips_already_done_targets() {
        let dir = tempfile::tempdir().unwrap();
        let sha_a = fixture_repo(dir.path(), "acme", "app");
        let sha_b = fixture_repo(dir.path(), "acme", "lib");
        let config = test_config(dir.path(), "exit 0", 1);

        let key_a = format!("acme/app@{sha_a}");
        let mut store = ProgressStore::initialize(&config.state_file, &config, 2).unwrap();
        store.record_done(&key_a, ScanStatus::CompletedClean).unwrap();

        let stream = TargetStream::from_vec(vec![
            commit_target("acme", "app", &sha_a),
            commit_target("acme", "lib", &sha_b),
        ]);
        let mut dispatcher = Dispatcher::new(Vec::new());
        let summary = run(stream, &config, &mut store, &mut dispatcher);

        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.clean, 1);
        assert!(store.contains(&format!("acme/lib@{sha_b}")));
    }

    #[test]
    fn test_pool_keeps_failed_targets_out_of_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let sha = fixture_repo(dir.path(), "acme", "app");
        let config = test_config(dir.path(), "exit 9", 1);

        let key = format!("acme/app@{sha}");
        let stream = TargetStream::from_vec(vec![commit_target("acme", "app", &sha)]);
        let mut store = ProgressStore::initialize(&config.state_file, &config, 1).unwrap();
        let mut dispatcher = Dispatcher::new(Vec::new());

        let summary = run(stream, &config, &mut store, &mut dispatcher);
        assert_eq!(summary.failed, 1);
        assert!(!store.contains(&key));
    }

    #[test]
    fn test_shutdown_flag_stops_dispatch() {
        // A pre-set shutdown flag models a signal arriving before dispatch:
        // nothing runs, nothing is recorded, the run reports interruption.
        let dir = tempfile::tempdir().unwrap();
        let sha = fixture_repo(dir.path(), "acme", "app");
        let config = test_config(dir.path(), "exit 0", 1);

        let shutdown = Arc::new(AtomicBool::new(true));
        let done = HashSet::new();
        let (task_tx, task_rx) = chan::bounded::<Target>(2);
        let (outcome_tx, outcome_rx) = chan::unbounded::<Outcome>();
        let stream = TargetStream::from_vec(vec![commit_target("acme", "app", &sha)]);

        feed_targets(stream, task_tx, outcome_tx, &done, &shutdown);
        assert!(task_rx.try_recv().is_err());
        assert!(outcome_rx.try_recv().is_err());
        let _ = config;
    }
}
