//! `eval`: run agent evaluations and inspect the ledger.

mod case;
mod cli;
mod console;

use std::io::{self, Write};
use std::path::PathBuf;
use std::process;

use anyhow::Result;
use clap::{Parser, Subcommand};
use harness::dsl::Registry;
use harness::exit_codes;
use harness::io::config::{DEFAULT_CONFIG_FILE, HarnessConfig, load_config};

#[derive(Parser)]
#[command(name = "eval", version, about = "Evaluate coding agents against judged tests")]
struct Cli {
    /// Harness configuration file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List tests defined in the cases directory.
    List,
    /// Show what each test would do, without running anything.
    Plan {
        /// Only tests whose id contains this text.
        #[arg(long)]
        filter: Option<String>,
        #[arg(long)]
        runner: Option<String>,
    },
    /// Run tests against every configured runner and record the verdicts.
    Run {
        /// Only tests whose id contains this text.
        #[arg(long)]
        filter: Option<String>,
        /// Only the runner with this name.
        #[arg(long)]
        runner: Option<String>,
    },
    /// Recorded runs, newest first.
    Runs {
        #[arg(long)]
        test: Option<String>,
    },
    /// One recorded run as JSON.
    Show { id: i64 },
    /// Suite tree with the latest result per runner.
    Tree,
    /// Pass rate and average score, override-aware.
    Stats {
        #[arg(long)]
        test: Option<String>,
    },
    /// Record a human score override for a run.
    Override {
        id: i64,
        #[arg(long)]
        score: f64,
        #[arg(long)]
        reason: String,
    },
    /// Override history for a run, newest first.
    Overrides { id: i64 },
}

impl Command {
    fn needs_cases(&self) -> bool {
        matches!(
            self,
            Command::List | Command::Plan { .. } | Command::Run { .. }
        )
    }
}

fn main() {
    harness::logging::init();
    let cli = Cli::parse();

    let config = match load_config(&cli.config) {
        Ok(config) => config,
        Err(err) => exit_with(exit_codes::CONFIG, &err),
    };
    let registry = if cli.command.needs_cases() {
        match case::load_registry(&config.cases_dir) {
            Ok(registry) => Some(registry),
            Err(err) => exit_with(exit_codes::CONFIG, &err),
        }
    } else {
        None
    };

    match dispatch(&config, cli.command, registry) {
        Ok(code) => process::exit(code),
        Err(err) => exit_with(exit_codes::FAILURES, &err),
    }
}

fn exit_with(code: i32, err: &anyhow::Error) -> ! {
    eprintln!("{err:#}");
    process::exit(code);
}

fn dispatch(
    config: &HarnessConfig,
    command: Command,
    registry: Option<Registry>,
) -> Result<i32> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let registry = registry.unwrap_or_default();
    match command {
        Command::List => cli::list_tests(&registry, &mut out)?,
        Command::Plan { filter, runner } => cli::plan_tests(
            config,
            &registry,
            filter.as_deref(),
            runner.as_deref(),
            &mut out,
        )?,
        Command::Run { filter, runner } => {
            return cli::run_tests(
                config,
                registry,
                filter.as_deref(),
                runner.as_deref(),
                &mut out,
            );
        }
        Command::Runs { test } => cli::list_runs(&config.open_ledger()?, test.as_deref(), &mut out)?,
        Command::Show { id } => cli::show_run(&config.open_ledger()?, id, &mut out)?,
        Command::Tree => cli::print_tree(&config.open_ledger()?, &mut out)?,
        Command::Stats { test } => {
            cli::print_stats(&config.open_ledger()?, test.as_deref(), &mut out)?
        }
        Command::Override { id, score, reason } => {
            cli::override_score(&config.open_ledger()?, id, score, &reason, &mut out)?
        }
        Command::Overrides { id } => cli::list_overrides(&config.open_ledger()?, id, &mut out)?,
    }
    out.flush()?;
    Ok(exit_codes::OK)
}
