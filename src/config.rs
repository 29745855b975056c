//! Run configuration resolution.
//!
//! Layered: built-in defaults, then an optional TOML
//! file, then `REVENANT_*` environment variables, then CLI flags. The result
//! is a [`RunConfig`] that is immutable for the lifetime of the run; nothing
//! downstream reads the environment again.
//!
//! Config file location:
//! - Linux: `~/.config/revenant/config.toml`
//! - macOS: `~/Library/Application Support/revenant/config.toml`
//!
//! ```toml
//! clone-base = "https://github.com"
//! results-dir = "results"
//!
//! [detector]
//! program = "trufflehog"
//! extra-args = ["--no-update"]
//!
//! [notifiers]
//! telegram = "revenant-notify telegram"
//! discord = "revenant-notify discord"
//! ```

use config::{Config, File};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cli::Cli;

pub const DEFAULT_BASE_TIMEOUT_SECS: u64 = 900;
pub const DEFAULT_MAX_TIMEOUT_SECS: u64 = 3600;
pub const DEFAULT_GIT_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_CLONE_BASE: &str = "https://github.com";
pub const DEFAULT_DETECTOR: &str = "trufflehog";

/// Ceiling for the auto-detected worker count.
const MAX_AUTO_WORKERS: usize = 8;

/// Order in which targets are dispatched to the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OrderPolicy {
    /// Shuffle with a clock-seeded RNG
    Random,
    /// Most recent push first
    Latest,
    /// Highest star metric first
    Stars,
    /// Preserve input order
    FileOrder,
}

impl std::fmt::Display for OrderPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OrderPolicy::Random => "random",
            OrderPolicy::Latest => "latest",
            OrderPolicy::Stars => "stars",
            OrderPolicy::FileOrder => "file-order",
        };
        f.write_str(name)
    }
}

/// Which backing store enumerates targets.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub events_db: Option<PathBuf>,
    pub events_file: Option<PathBuf>,
    pub orgs_file: Option<PathBuf>,
    /// Explicit target spec from the positional argument.
    pub single: Option<String>,
}

impl SourceConfig {
    /// Identity string frozen into the progress store for resume sanity.
    pub fn describe(&self) -> String {
        if let Some(spec) = &self.single {
            return format!("single:{spec}");
        }
        if let Some(p) = &self.orgs_file {
            return format!("orgs-file:{}", p.display());
        }
        if let Some(p) = &self.events_db {
            return format!("events-db:{}", p.display());
        }
        if let Some(p) = &self.events_file {
            return format!("events-file:{}", p.display());
        }
        "none".to_string()
    }
}

/// How to treat an existing progress store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeMode {
    /// No store expected; create one.
    Fresh,
    /// Use the store as a skip filter.
    Resume,
    /// Delete the store, then behave like Fresh.
    Restart,
}

/// Detector subprocess selection.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub program: PathBuf,
    /// Optional flags appended to the preferred command variant only.
    pub extra_args: Vec<String>,
}

/// One enabled notification channel and the notifier argv it invokes.
#[derive(Debug, Clone)]
pub struct NotifyChannel {
    pub name: String,
    pub command: Vec<String>,
}

/// Everything the run needs, resolved once at startup.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub source: SourceConfig,
    pub order: OrderPolicy,
    pub workers: usize,
    pub base_timeout: Duration,
    pub max_timeout: Duration,
    pub git_timeout: Duration,
    pub max_retries: u32,
    pub results_dir: PathBuf,
    pub state_file: PathBuf,
    pub resume: ResumeMode,
    pub channels: Vec<NotifyChannel>,
    pub detector: DetectorConfig,
    pub clone_base: String,
    pub debug: bool,
}

/// Shape of the TOML config file (all fields optional).
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
struct FileConfig {
    clone_base: Option<String>,
    results_dir: Option<PathBuf>,
    state_file: Option<PathBuf>,
    order: Option<OrderPolicy>,
    workers: Option<usize>,
    base_timeout: Option<u64>,
    max_timeout: Option<u64>,
    git_timeout: Option<u64>,
    max_retries: Option<u32>,
    detector: DetectorFileConfig,
    /// channel name -> notifier command line
    notifiers: BTreeMap<String, String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
struct DetectorFileConfig {
    program: Option<String>,
    extra_args: Vec<String>,
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("revenant").join("config.toml"))
}

fn load_file_config(explicit: Option<&Path>) -> anyhow::Result<FileConfig> {
    let mut builder = Config::builder();

    let path = match explicit {
        Some(p) => Some(p.to_path_buf()),
        None => default_config_path().filter(|p| p.exists()),
    };
    if let Some(path) = path {
        builder = builder.add_source(File::from(path));
    }

    // REVENANT_RESULTS_DIR, REVENANT_WORKERS, ... map onto the kebab-case keys
    builder = builder.add_source(
        config::Environment::with_prefix("REVENANT")
            .convert_case(config::Case::Kebab)
            .try_parsing(true),
    );

    let cfg = builder.build()?.try_deserialize()?;
    Ok(cfg)
}

/// Deterministic worker-count default: `min(cpu_cores/2, memory_gb/2, 8)`,
/// clamped to at least 1. The memory term is dropped when the platform
/// doesn't expose total memory.
pub fn default_workers() -> usize {
    let cpu_term = num_cpus::get() / 2;
    let mut workers = cpu_term.min(MAX_AUTO_WORKERS);
    if let Some(gb) = detect_memory_gb() {
        workers = workers.min((gb / 2) as usize);
    }
    workers.max(1)
}

/// Total system memory in whole gigabytes, via `/proc/meminfo`.
fn detect_memory_gb() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    let kb: u64 = meminfo
        .lines()
        .find(|l| l.starts_with("MemTotal:"))?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()?;
    Some(kb / (1024 * 1024))
}

impl RunConfig {
    /// Resolve the full configuration from CLI flags, environment, and the
    /// optional config file. Fails on invalid combinations; the caller
    /// reports and exits with the initialization-failure code.
    pub fn resolve(cli: &Cli) -> anyhow::Result<RunConfig> {
        let file = load_file_config(cli.config.as_deref())?;

        let source = SourceConfig {
            events_db: cli.events_db.clone(),
            events_file: cli.events_file.clone(),
            orgs_file: cli.orgs_file.clone(),
            single: cli.target.clone(),
        };
        if source.single.is_none()
            && source.events_db.is_none()
            && source.events_file.is_none()
            && source.orgs_file.is_none()
        {
            anyhow::bail!(
                "no target source: pass a target, --events-db, --events-file, or --orgs-file"
            );
        }

        let workers = match cli.workers.or(file.workers) {
            Some(0) => anyhow::bail!("--workers must be at least 1"),
            Some(n) => n,
            None => default_workers(),
        };

        let base_timeout = cli
            .base_timeout
            .or(file.base_timeout)
            .unwrap_or(DEFAULT_BASE_TIMEOUT_SECS);
        let max_timeout = file.max_timeout.unwrap_or(DEFAULT_MAX_TIMEOUT_SECS);
        if base_timeout == 0 {
            anyhow::bail!("--base-timeout must be at least 1 second");
        }
        if base_timeout > max_timeout {
            anyhow::bail!(
                "base timeout ({base_timeout}s) exceeds the maximum timeout ({max_timeout}s)"
            );
        }

        let results_dir = cli
            .results_dir
            .clone()
            .or(file.results_dir)
            .unwrap_or_else(|| PathBuf::from("results"));
        let state_file = cli
            .state_file
            .clone()
            .or(file.state_file)
            .unwrap_or_else(|| results_dir.join("scan_state.json"));

        let max_retries = cli.max_retries.or(file.max_retries).unwrap_or(DEFAULT_MAX_RETRIES);
        if max_retries == 0 {
            anyhow::bail!("--max-retries must be at least 1 (it bounds detector attempts)");
        }

        let resume = match (cli.resume, cli.restart) {
            (true, _) => ResumeMode::Resume,
            (_, true) => ResumeMode::Restart,
            _ => ResumeMode::Fresh,
        };

        // The detector path may come from the environment (read here, once).
        let program = std::env::var("REVENANT_DETECTOR_PATH")
            .ok()
            .or(file.detector.program)
            .unwrap_or_else(|| DEFAULT_DETECTOR.to_string());
        let detector = DetectorConfig {
            program: PathBuf::from(program),
            extra_args: file.detector.extra_args,
        };

        let channels = resolve_channels(&cli.notify, &file.notifiers)?;

        Ok(RunConfig {
            source,
            order: cli.order.or(file.order).unwrap_or(OrderPolicy::Random),
            workers,
            base_timeout: Duration::from_secs(base_timeout),
            max_timeout: Duration::from_secs(max_timeout),
            git_timeout: Duration::from_secs(file.git_timeout.unwrap_or(DEFAULT_GIT_TIMEOUT_SECS)),
            max_retries,
            results_dir,
            state_file,
            resume,
            channels,
            detector,
            clone_base: file
                .clone_base
                .unwrap_or_else(|| DEFAULT_CLONE_BASE.to_string()),
            debug: cli.debug,
        })
    }
}

/// Each enabled channel needs a notifier command, from the config file's
/// `[notifiers]` table or a `REVENANT_NOTIFIER_<CHANNEL>` variable.
fn resolve_channels(
    enabled: &[String],
    configured: &BTreeMap<String, String>,
) -> anyhow::Result<Vec<NotifyChannel>> {
    let mut channels = Vec::with_capacity(enabled.len());
    for name in enabled {
        let env_key = format!("REVENANT_NOTIFIER_{}", name.to_uppercase().replace('-', "_"));
        let line = std::env::var(&env_key)
            .ok()
            .or_else(|| configured.get(name).cloned())
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "notification channel '{name}' has no notifier command \
                     (set [notifiers] in the config file or {env_key})"
                )
            })?;
        let command = shlex::split(&line)
            .filter(|argv| !argv.is_empty())
            .ok_or_else(|| {
                anyhow::anyhow!("notifier command for channel '{name}' is not a valid command line")
            })?;
        channels.push(NotifyChannel {
            name: name.clone(),
            command,
        });
    }
    Ok(channels)
}
