//! Asynchronous, best-effort notification dispatch.
//!
//! The pool hands finding-bearing outcomes to [`Dispatcher::observe`],
//! which enqueues events and returns immediately; a background thread
//! drains the queue and pipes each event as JSON into the configured
//! notifier subprocess per channel. Delivery failures are logged, never
//! propagated, and the scan never waits on a network operation.

use crossbeam_channel as chan;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use crate::config::NotifyChannel;
use crate::exec::{self, CancelToken};
use crate::scan::{Finding, Outcome};

/// A notifier that hangs is killed after this long.
const NOTIFIER_TIMEOUT: Duration = Duration::from_secs(30);

/// Characters of the raw secret shown in previews.
const PREVIEW_RAW_CHARS: usize = 6;

#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum NotifyEvent {
    /// First findings for an organization within this run.
    #[serde(rename_all = "snake_case")]
    Immediate {
        organization: String,
        target: String,
        preview: FindingPreview,
    },
    /// A finding-bearing target finished and its artifact is in place.
    #[serde(rename_all = "snake_case")]
    Completion {
        organization: String,
        target: String,
        count: usize,
        /// Finding count per detector name.
        breakdown: BTreeMap<String, usize>,
        artifact: String,
    },
}

#[derive(Debug, Serialize)]
pub struct FindingPreview {
    pub detector: String,
    pub file: Option<String>,
    /// Leading characters only; the full secret stays in the artifact.
    pub raw_prefix: String,
}

impl FindingPreview {
    fn from_finding(finding: &Finding) -> FindingPreview {
        let raw = finding.record.get("Raw").and_then(|v| v.as_str()).unwrap_or("");
        let file = finding
            .record
            .pointer("/SourceMetadata/Data/Git/file")
            .and_then(|v| v.as_str())
            .map(String::from);
        FindingPreview {
            detector: finding.detector_name.clone(),
            file,
            raw_prefix: truncate_raw(raw),
        }
    }
}

fn truncate_raw(raw: &str) -> String {
    let prefix: String = raw.chars().take(PREVIEW_RAW_CHARS).collect();
    if raw.chars().count() > PREVIEW_RAW_CHARS {
        format!("{prefix}…")
    } else {
        prefix
    }
}

pub struct Dispatcher {
    tx: Option<chan::Sender<NotifyEvent>>,
    handle: Option<std::thread::JoinHandle<()>>,
    /// Orgs that already triggered an immediate alert this run.
    alerted_orgs: HashSet<String>,
}

impl Dispatcher {
    /// No channels means a no-op dispatcher; no thread is spawned.
    pub fn new(channels: Vec<NotifyChannel>) -> Dispatcher {
        if channels.is_empty() {
            return Dispatcher {
                tx: None,
                handle: None,
                alerted_orgs: HashSet::new(),
            };
        }

        let (tx, rx) = chan::unbounded::<NotifyEvent>();
        let handle = std::thread::spawn(move || {
            for event in rx {
                for channel in &channels {
                    deliver(channel, &event);
                }
            }
        });
        Dispatcher {
            tx: Some(tx),
            handle: Some(handle),
            alerted_orgs: HashSet::new(),
        }
    }

    /// Queue the events an outcome warrants. Returns immediately.
    pub fn observe(&mut self, outcome: &Outcome) {
        if self.tx.is_none() || outcome.findings.is_empty() {
            return;
        }

        if self.alerted_orgs.insert(outcome.organization.clone()) {
            self.enqueue(NotifyEvent::Immediate {
                organization: outcome.organization.clone(),
                target: outcome.key.clone(),
                preview: FindingPreview::from_finding(&outcome.findings[0]),
            });
        }

        let mut breakdown: BTreeMap<String, usize> = BTreeMap::new();
        for finding in &outcome.findings {
            *breakdown.entry(finding.detector_name.clone()).or_default() += 1;
        }
        self.enqueue(NotifyEvent::Completion {
            organization: outcome.organization.clone(),
            target: outcome.key.clone(),
            count: outcome.findings.len(),
            breakdown,
            artifact: outcome
                .artifact
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
        });
    }

    /// Drain pending dispatches within a bounded grace period. Whatever is
    /// still undelivered afterwards is dropped with a warning.
    pub fn shutdown(mut self, grace: Duration) {
        drop(self.tx.take());
        let Some(handle) = self.handle.take() else {
            return;
        };

        let deadline = Instant::now() + grace;
        while !handle.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(50));
        }
        if handle.is_finished() {
            let _ = handle.join();
        } else {
            log::warn!("notification dispatch did not drain within {grace:?}; pending events dropped");
        }
    }

    fn enqueue(&self, event: NotifyEvent) {
        if let Some(tx) = &self.tx
            && tx.send(event).is_err()
        {
            log::warn!("notification queue closed; event dropped");
        }
    }
}

/// Invoke one channel's notifier with the event JSON on stdin.
fn deliver(channel: &NotifyChannel, event: &NotifyEvent) {
    let json = match serde_json::to_string(event) {
        Ok(json) => json,
        Err(e) => {
            log::warn!("could not serialize notification event: {e}");
            return;
        }
    };

    let (program, args) = match channel.command.split_first() {
        Some(parts) => parts,
        None => return,
    };

    log::debug!("$ {} [notify:{}]", channel.command.join(" "), channel.name);
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    exec::isolate_process_group(&mut cmd);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            log::warn!("notifier for channel '{}' failed to start: {e}", channel.name);
            return;
        }
    };

    // Write errors mean the notifier exited early; its exit status tells more
    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(json.as_bytes());
    }

    match exec::wait_child(&mut child, NOTIFIER_TIMEOUT, &CancelToken::unbounded()) {
        Ok(exec::WaitOutcome::Exited(status)) if status.success() => {}
        Ok(exec::WaitOutcome::Exited(status)) => {
            log::warn!("notifier for channel '{}' exited with {status}", channel.name);
        }
        Ok(_) => {
            log::warn!("notifier for channel '{}' timed out and was killed", channel.name);
        }
        Err(e) => {
            log::warn!("notifier for channel '{}' failed: {e}", channel.name);
        }
    }
}
