//! Command-line surface of the orchestrator binary.

use clap::Parser;
use clap::builder::styling::{AnsiColor, Color, Styles};
use std::path::PathBuf;

use crate::config::OrderPolicy;

/// Custom styles for help output - matches revenant's color scheme
fn help_styles() -> Styles {
    Styles::styled()
        .header(
            anstyle::Style::new()
                .bold()
                .fg_color(Some(Color::Ansi(AnsiColor::Green))),
        )
        .usage(
            anstyle::Style::new()
                .bold()
                .fg_color(Some(Color::Ansi(AnsiColor::Green))),
        )
        .literal(
            anstyle::Style::new()
                .bold()
                .fg_color(Some(Color::Ansi(AnsiColor::Cyan))),
        )
        .placeholder(anstyle::Style::new().fg_color(Some(Color::Ansi(AnsiColor::Cyan))))
        .error(
            anstyle::Style::new()
                .bold()
                .fg_color(Some(Color::Ansi(AnsiColor::Red))),
        )
}

#[derive(Parser, Debug)]
#[command(name = "revenant")]
#[command(about = "Hunts verified secrets in force-pushed dangling GitHub commits")]
#[command(version)]
#[command(styles = help_styles())]
#[command(
    after_long_help = r#"A target source must be selected: --events-db, --events-file, --orgs-file,
or an explicit TARGET. Scanning an organization requires an events database
to enumerate its commits.

Exit codes: 0 on completion (even with failed targets), 130 when interrupted
by a signal (state preserved, rerun with --resume), 2 on initialization
failure."#
)]
pub struct Cli {
    /// Explicit target: an organization, owner/repo, or org/repo@commit
    #[arg(value_name = "target")]
    pub target: Option<String>,

    /// SQLite database of force-push events
    #[arg(long, value_name = "path", help_heading = "Target Source")]
    pub events_db: Option<PathBuf>,

    /// CSV export of force-push events (same schema as the database)
    #[arg(
        long,
        value_name = "path",
        conflicts_with = "events_db",
        help_heading = "Target Source"
    )]
    pub events_file: Option<PathBuf>,

    /// Plain-text list of organizations to scan, one per line
    #[arg(long, value_name = "path", help_heading = "Target Source")]
    pub orgs_file: Option<PathBuf>,

    /// Order in which targets are dispatched
    #[arg(long, value_enum, value_name = "policy", help_heading = "Scheduling")]
    pub order: Option<OrderPolicy>,

    /// Parallel scan workers (default: derived from CPU and memory)
    #[arg(long, value_name = "n", help_heading = "Scheduling")]
    pub workers: Option<usize>,

    /// Base per-target detector timeout in seconds
    #[arg(long, value_name = "secs", help_heading = "Scheduling")]
    pub base_timeout: Option<u64>,

    /// Detector timeout retries per target
    #[arg(long, value_name = "n", help_heading = "Scheduling")]
    pub max_retries: Option<u32>,

    /// Directory receiving findings artifacts
    #[arg(long, value_name = "dir", help_heading = "State")]
    pub results_dir: Option<PathBuf>,

    /// Progress store path (default: <results-dir>/scan_state.json)
    #[arg(long, value_name = "path", help_heading = "State")]
    pub state_file: Option<PathBuf>,

    /// Skip targets already recorded in the progress store
    #[arg(long, conflicts_with = "restart", help_heading = "State")]
    pub resume: bool,

    /// Delete the progress store and start fresh
    #[arg(long, help_heading = "State")]
    pub restart: bool,

    /// Notification channel to enable (repeatable); commands come from config
    #[arg(long = "notify", value_name = "channel", help_heading = "Notifications")]
    pub notify: Vec<String>,

    /// User config file path
    #[arg(long, value_name = "path")]
    pub config: Option<PathBuf>,

    /// Verbose logging; retains per-target detector logs
    #[arg(long)]
    pub debug: bool,
}
