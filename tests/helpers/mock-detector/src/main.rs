//! Scripted stand-in for the secret detector.
//!
//! Reads a JSON behavior file named by `MOCK_DETECTOR_BEHAVIOR`:
//!
//! ```json
//! {
//!   "invocations": [
//!     { "sleep_ms": 5000 },
//!     { "exit_code": 0, "stdout": ["{\"DetectorName\":\"AWS\",\"Verified\":true}"] }
//!   ]
//! }
//! ```
//!
//! The nth invocation uses the nth entry (the last one repeats once the
//! list is exhausted). Side effects, both for test assertions:
//! - `<behavior>.count` holds the total invocation count
//! - `<behavior>.log` accumulates one argv line per invocation
//!
//! The counter is bumped before any sleep so invocations killed by the
//! orchestrator's timeout still register.

use serde::Deserialize;
use std::env;
use std::fs;
use std::io::Write;
use std::process::exit;
use std::time::Duration;

#[derive(Debug, Default, Deserialize)]
struct Behavior {
    #[serde(default)]
    invocations: Vec<Invocation>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct Invocation {
    #[serde(default)]
    sleep_ms: u64,
    #[serde(default)]
    exit_code: i32,
    #[serde(default)]
    stdout: Vec<String>,
    #[serde(default)]
    stderr: Option<String>,
}

fn main() {
    let Ok(behavior_path) = env::var("MOCK_DETECTOR_BEHAVIOR") else {
        eprintln!("mock-detector: MOCK_DETECTOR_BEHAVIOR not set");
        exit(64);
    };
    let behavior: Behavior = fs::read_to_string(&behavior_path)
        .ok()
        .and_then(|content| serde_json::from_str(&content).ok())
        .unwrap_or_default();

    let count_path = format!("{behavior_path}.count");
    let count: usize = fs::read_to_string(&count_path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0);
    fs::write(&count_path, (count + 1).to_string()).expect("write invocation counter");

    let argv: Vec<String> = env::args().skip(1).collect();
    if let Ok(mut log) = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(format!("{behavior_path}.log"))
    {
        let _ = writeln!(log, "{}", argv.join(" "));
    }

    let invocation = behavior
        .invocations
        .get(count)
        .or(behavior.invocations.last())
        .cloned()
        .unwrap_or_default();

    if invocation.sleep_ms > 0 {
        std::thread::sleep(Duration::from_millis(invocation.sleep_ms));
    }
    for line in &invocation.stdout {
        println!("{line}");
    }
    if let Some(stderr) = &invocation.stderr {
        eprintln!("{stderr}");
    }
    exit(invocation.exit_code);
}
