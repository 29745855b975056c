use clap::Parser;
use std::process;
use std::time::Duration;

use revenant::cli::Cli;
use revenant::config::{ResumeMode, RunConfig};
use revenant::notify::Dispatcher;
use revenant::pool;
use revenant::progress::{LoadOutcome, ProgressStore};
use revenant::scan::workspace;
use revenant::source;
use revenant::styling::{ERROR, ERROR_EMOJI, INFO_EMOJI, eprintln, println};

/// Unrecoverable initialization failure (missing source, corrupt state,
/// invalid config). Distinct from per-target failures, which exit 0.
const INIT_FAILURE: i32 = 2;

/// How long shutdown waits for queued notifications to drain.
const DISPATCH_GRACE: Duration = Duration::from_secs(5);

fn main() {
    let cli = Cli::parse();
    init_logging(cli.debug);

    match run(&cli) {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("{ERROR_EMOJI} {ERROR}{e:#}{ERROR:#}");
            process::exit(INIT_FAILURE);
        }
    }
}

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();
}

fn run(cli: &Cli) -> anyhow::Result<i32> {
    let config = RunConfig::resolve(cli)?;

    // Prior crashed runs may have left workspaces behind
    workspace::sweep_orphans();

    let targets = source::stream(&config)?;
    let total = targets.total();
    let mut store = prepare_store(&config, total)?;

    println!(
        "{INFO_EMOJI} scanning {total} target(s) with {} worker(s), {} order",
        config.workers, config.order
    );

    let mut dispatcher = Dispatcher::new(config.channels.clone());
    let summary = pool::run(targets, &config, &mut store, &mut dispatcher);
    dispatcher.shutdown(DISPATCH_GRACE);

    println!(
        "{INFO_EMOJI} {} clean, {} with findings, {} failed, {} timed out, {} skipped",
        summary.clean, summary.with_findings, summary.failed, summary.timed_out, summary.skipped
    );
    if summary.interrupted {
        println!(
            "{INFO_EMOJI} interrupted; progress preserved at {} (rerun with --resume)",
            store.path().display()
        );
    }

    Ok(summary.exit_code())
}

fn prepare_store(config: &RunConfig, total: usize) -> anyhow::Result<ProgressStore> {
    match config.resume {
        ResumeMode::Restart => {
            ProgressStore::delete(&config.state_file)?;
            Ok(ProgressStore::initialize(&config.state_file, config, total)?)
        }
        ResumeMode::Resume => match ProgressStore::load(&config.state_file)? {
            LoadOutcome::Loaded(state) => {
                log::info!(
                    "resuming: {} target(s) already recorded in {}",
                    state.scanned_orgs.len(),
                    config.state_file.display()
                );
                Ok(ProgressStore::resume(&config.state_file, state))
            }
            LoadOutcome::NotFound => {
                log::info!("no progress store at {}; starting fresh", config.state_file.display());
                Ok(ProgressStore::initialize(&config.state_file, config, total)?)
            }
        },
        ResumeMode::Fresh => match ProgressStore::load(&config.state_file)? {
            LoadOutcome::NotFound => {
                Ok(ProgressStore::initialize(&config.state_file, config, total)?)
            }
            LoadOutcome::Loaded(_) => anyhow::bail!(
                "progress store {} already exists; rerun with --resume to continue it \
                 or --restart to discard it",
                config.state_file.display()
            ),
        },
    }
}
