//! Subprocess execution with deadlines and cooperative cancellation.
//!
//! All external commands (git, the detector, notifiers) go through this
//! module so every spawn gets consistent `$ program args [context]` debug
//! logging and the same termination discipline: graceful signal first, then
//! a forced kill after a short grace period. Detector processes are placed
//! in their own process group so the whole tree dies with them.

use std::process::{Child, Command, ExitStatus, Output, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Poll interval while waiting on a child process.
const WAIT_POLL: Duration = Duration::from_millis(25);

/// Time between the graceful termination request and the forced kill.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Cancellation signal distributed from the pool into a scan task.
///
/// Combines the run-wide shutdown flag with the per-target hard wall-clock
/// deadline. Blocking operations poll this between wait iterations.
#[derive(Debug, Clone)]
pub struct CancelToken {
    shutdown: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new(shutdown: Arc<AtomicBool>, deadline: Option<Instant>) -> Self {
        Self { shutdown, deadline }
    }

    /// A token that never fires. Used by startup code and tests.
    pub fn unbounded() -> Self {
        Self {
            shutdown: Arc::new(AtomicBool::new(false)),
            deadline: None,
        }
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    pub fn deadline_exceeded(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Clamp a timeout so it never extends past the hard deadline.
    pub fn clamp(&self, timeout: Duration) -> Duration {
        match self.deadline {
            Some(d) => timeout.min(d.saturating_duration_since(Instant::now())),
            None => timeout,
        }
    }
}

/// Why a waited-on child stopped.
#[derive(Debug)]
pub enum WaitOutcome {
    Exited(ExitStatus),
    /// The per-call timeout elapsed; the process group has been killed.
    TimedOut,
    /// Shutdown or the hard deadline fired; the process group has been killed.
    Cancelled,
}

fn command_line(cmd: &Command) -> String {
    let program = cmd.get_program().to_string_lossy();
    let args: Vec<_> = cmd.get_args().map(|a| a.to_string_lossy()).collect();
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{} {}", program, args.join(" "))
    }
}

fn log_spawn(cmd: &Command, context: Option<&str>) -> String {
    let cmd_str = command_line(cmd);
    match context {
        Some(ctx) => log::debug!("$ {} [{}]", cmd_str, ctx),
        None => log::debug!("$ {}", cmd_str),
    }
    cmd_str
}

fn log_trace(cmd_str: &str, context: Option<&str>, t0: Instant, ok: &str) {
    let duration_ms = t0.elapsed().as_secs_f64() * 1000.0;
    match context {
        Some(ctx) => log::debug!(
            "[rv-trace] context={} cmd=\"{}\" dur={:.1}ms {}",
            ctx,
            cmd_str,
            duration_ms,
            ok
        ),
        None => log::debug!("[rv-trace] cmd=\"{}\" dur={:.1}ms {}", cmd_str, duration_ms, ok),
    }
}

/// Run a command with captured output under a timeout and a cancel token.
///
/// Stdout and stderr are drained on background threads so the child never
/// blocks on a full pipe. On timeout the process group is killed and
/// `ErrorKind::TimedOut` is returned; on cancellation, `ErrorKind::Interrupted`.
pub fn run_captured(
    cmd: &mut Command,
    context: Option<&str>,
    timeout: Duration,
    cancel: &CancelToken,
) -> std::io::Result<Output> {
    use std::io::Read;

    let cmd_str = log_spawn(cmd, context);
    let t0 = Instant::now();

    cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
    isolate_process_group(cmd);
    let mut child = cmd.spawn()?;

    let mut stdout_handle = child.stdout.take();
    let mut stderr_handle = child.stderr.take();
    let stdout_thread = std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(ref mut handle) = stdout_handle {
            let _ = handle.read_to_end(&mut buf);
        }
        buf
    });
    let stderr_thread = std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(ref mut handle) = stderr_handle {
            let _ = handle.read_to_end(&mut buf);
        }
        buf
    });

    let outcome = wait_child(&mut child, cancel.clamp(timeout), cancel)?;

    // Reader threads see EOF once the child (and its group) is gone.
    let stdout = stdout_thread.join().unwrap_or_default();
    let stderr = stderr_thread.join().unwrap_or_default();

    match outcome {
        WaitOutcome::Exited(status) => {
            log_trace(&cmd_str, context, t0, &format!("ok={}", status.success()));
            Ok(Output { status, stdout, stderr })
        }
        WaitOutcome::TimedOut => {
            log_trace(&cmd_str, context, t0, "err=\"timed out\"");
            Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "command timed out"))
        }
        WaitOutcome::Cancelled => {
            log_trace(&cmd_str, context, t0, "err=\"cancelled\"");
            Err(std::io::Error::new(std::io::ErrorKind::Interrupted, "command cancelled"))
        }
    }
}

/// Wait on an already-spawned child under a timeout and a cancel token.
///
/// Used directly by the detector invocation, which streams stdout to a file
/// instead of capturing it. On timeout or cancellation the child's process
/// group receives a graceful termination request, then a forced kill after
/// [`KILL_GRACE`]; the child is always reaped before returning.
pub fn wait_child(
    child: &mut Child,
    timeout: Duration,
    cancel: &CancelToken,
) -> std::io::Result<WaitOutcome> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(WaitOutcome::Exited(status));
        }
        if cancel.shutdown_requested() || cancel.deadline_exceeded() {
            terminate(child);
            return Ok(WaitOutcome::Cancelled);
        }
        if Instant::now() >= deadline {
            terminate(child);
            return Ok(WaitOutcome::TimedOut);
        }
        std::thread::sleep(WAIT_POLL);
    }
}

/// Put the child in its own process group so termination reaches the whole
/// tree (detectors fork helpers; git spawns remote transports).
pub fn isolate_process_group(cmd: &mut Command) {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    #[cfg(not(unix))]
    let _ = cmd;
}

/// Graceful-then-forced termination of the child's process group.
///
/// SIGTERM first, then SIGKILL after [`KILL_GRACE`] if the group is still
/// alive. Always reaps the direct child.
fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        let pgid = nix::unistd::Pid::from_raw(child.id() as i32);
        let _ = nix::sys::signal::killpg(pgid, nix::sys::signal::Signal::SIGTERM);
        let deadline = Instant::now() + KILL_GRACE;
        while Instant::now() < deadline {
            match child.try_wait() {
                Ok(Some(_)) => break,
                Ok(None) => std::thread::sleep(Duration::from_millis(100)),
                Err(_) => break,
            }
        }
        if !group_gone(pgid) {
            let _ = nix::sys::signal::killpg(pgid, nix::sys::signal::Signal::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.kill();
    }
    let _ = child.wait();
}

#[cfg(unix)]
fn group_gone(pgid: nix::unistd::Pid) -> bool {
    matches!(
        nix::sys::signal::killpg(pgid, None),
        Err(nix::errno::Errno::ESRCH)
    )
}
