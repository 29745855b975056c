//! Detector subprocess invocation.
//!
//! The detector is an external collaborator: it gets a repository path and
//! the JSON + verified-only hints, and emits newline-delimited JSON records
//! on stdout. Stdout streams straight to a file in the workspace (findings
//! can be large); stderr is captured for diagnostics.

use std::ffi::OsString;
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use crate::config::DetectorConfig;
use crate::exec::{self, CancelToken, WaitOutcome};

/// Captured stderr is bounded; detectors can be chatty on huge histories.
const STDERR_CAP: usize = 64 * 1024;

/// One detector invocation's result.
#[derive(Debug)]
pub enum DetectorRun {
    Exited { code: Option<i32>, success: bool, stderr: String },
    /// Budget exceeded; the process group has been killed.
    TimedOut,
    /// Shutdown or hard deadline; the process group has been killed.
    Cancelled,
}

/// The command preference list, most capable first:
/// 1. git-history scan with verified-only output plus configured extras
/// 2. the same without optional flags
/// 3. a minimal filesystem scan
///
/// Non-timeout failures fall through this list; timeouts retry within a
/// variant. Output from every variant passes the same verified-only filter
/// downstream, so the minimal variant can never smuggle unverified records
/// into results.
pub fn command_variants(detector: &DetectorConfig, repo_dir: &Path) -> Vec<Vec<OsString>> {
    let program: OsString = detector.program.clone().into();
    let repo_url = {
        let mut url = OsString::from("file://");
        url.push(repo_dir.as_os_str());
        url
    };

    let mut preferred: Vec<OsString> = vec![
        program.clone(),
        "git".into(),
        repo_url.clone(),
        "--json".into(),
        "--only-verified".into(),
    ];
    preferred.extend(detector.extra_args.iter().map(OsString::from));

    let fallback: Vec<OsString> = vec![
        program.clone(),
        "git".into(),
        repo_url,
        "--json".into(),
        "--only-verified".into(),
    ];

    let minimal: Vec<OsString> = vec![
        program,
        "filesystem".into(),
        repo_dir.as_os_str().to_os_string(),
        "--json".into(),
    ];

    let mut variants = vec![preferred];
    // The fallback only differs when extras exist; don't re-run identical commands
    if !detector.extra_args.is_empty() {
        variants.push(fallback);
    }
    variants.push(minimal);
    variants
}

/// Run one command variant under the given budget, streaming stdout to
/// `stdout_path`. The budget is additionally clamped to the target's hard
/// deadline by the cancel token.
pub fn run_variant(
    argv: &[OsString],
    stdout_path: &Path,
    budget: Duration,
    cancel: &CancelToken,
    context: &str,
) -> std::io::Result<DetectorRun> {
    let Some((program, args)) = argv.split_first() else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "empty detector command",
        ));
    };

    let stdout_file = std::fs::File::create(stdout_path)?;
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout_file))
        .stderr(Stdio::piped());
    exec::isolate_process_group(&mut cmd);

    log::debug!(
        "$ {} [{}] (budget {}s)",
        argv.iter().map(|a| a.to_string_lossy()).collect::<Vec<_>>().join(" "),
        context,
        budget.as_secs()
    );

    let mut child = cmd.spawn()?;

    let stderr_handle = child.stderr.take();
    let stderr_thread = std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(handle) = stderr_handle {
            let mut limited = handle.take(STDERR_CAP as u64);
            let _ = limited.read_to_end(&mut buf);
        }
        buf
    });

    let outcome = exec::wait_child(&mut child, cancel.clamp(budget), cancel)?;
    let stderr_bytes = stderr_thread.join().unwrap_or_default();
    let stderr = String::from_utf8_lossy(&stderr_bytes).into_owned();

    Ok(match outcome {
        WaitOutcome::Exited(status) => DetectorRun::Exited {
            code: status.code(),
            success: status.success(),
            stderr,
        },
        WaitOutcome::TimedOut => DetectorRun::TimedOut,
        WaitOutcome::Cancelled => DetectorRun::Cancelled,
    })
}
