//! # Tally CLI
//!
//! Runs the pure calculation engine over JSON files.
//!
//! ## Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        tally <command>                                  │
//! │                                                                         │
//! │  TallyConfig::load ──► tracing init ──► read files ──► tally-core       │
//! │                                                            │            │
//! │                                      stdout ◄── response JSON           │
//! │                                                                         │
//! │  exit 0  success                                                        │
//! │  exit 2  failure envelope (engine rejected the calculation)             │
//! │  exit 1  I/O or configuration error                                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

mod commands;
mod config;
mod error;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tally_core::AllocationStrategy;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::commands::{OptionOverrides, Outcome};
use crate::config::TallyConfig;
use crate::error::ConfigResult;

/// Filter level while the config file is loading.
const BOOTSTRAP_LEVEL: &str = "warn";

#[derive(Debug, Parser)]
#[command(name = "tally", version, about = "Deterministic fee, commission and payroll calculations")]
struct Cli {
    /// Config file (defaults to the platform config dir's tally.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Compact JSON output.
    #[arg(long, global = true)]
    compact: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Calculate fees for an input under the best matching policy.
    Calculate {
        /// CalculationInput JSON file, or `-` for stdin.
        #[arg(long)]
        input: PathBuf,

        /// Policy JSON file: one policy object or an array of candidates.
        #[arg(long)]
        policies: PathBuf,

        #[command(flatten)]
        engine: EngineArgs,

        /// Allocation strategy: by_net, by_gross, by_quantity, equal.
        #[arg(long)]
        strategy: Option<AllocationStrategy>,
    },

    /// Run a payroll formula set.
    Payroll {
        /// PayrollInput JSON file, or `-` for stdin.
        #[arg(long)]
        input: PathBuf,

        #[command(flatten)]
        engine: EngineArgs,
    },

    /// Print the v1 and v2 hashes of a policy.
    Hash {
        #[arg(long)]
        policy: PathBuf,
    },
}

#[derive(Debug, Args)]
struct EngineArgs {
    /// Decimal places of money results (0-10).
    #[arg(long)]
    precision: Option<u32>,

    /// Fail on data edge cases instead of defaulting.
    #[arg(long, conflicts_with = "lenient")]
    strict: bool,

    /// Default data edge cases and report warnings.
    #[arg(long)]
    lenient: bool,
}

impl EngineArgs {
    fn overrides(&self, strategy: Option<AllocationStrategy>) -> OptionOverrides {
        let strict = match (self.strict, self.lenient) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        };
        OptionOverrides {
            precision: self.precision,
            strict,
            strategy,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(cli.config.clone()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("tally: {}", e);
            return ExitCode::from(1);
        }
    };
    init_tracing(&config);
    info!(source = %config.source, level = %config.logging.level, "Configuration loaded");

    match run(cli, &config) {
        Ok(outcome) if outcome.success => ExitCode::SUCCESS,
        Ok(_) => ExitCode::from(2),
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("tally: {:#}", e);
            ExitCode::from(1)
        }
    }
}

fn run(cli: Cli, config: &TallyConfig) -> Result<Outcome> {
    let options = config.engine.options();
    let outcome = match &cli.command {
        Command::Calculate {
            input,
            policies,
            engine,
            strategy,
        } => commands::calculate(input, policies, &engine.overrides(*strategy).apply(options))?,
        Command::Payroll { input, engine } => {
            commands::payroll(input, &engine.overrides(None).apply(options))?
        }
        Command::Hash { policy } => commands::hash(policy)?,
    };

    let pretty = config.output.pretty && !cli.compact;
    let text = if pretty {
        serde_json::to_string_pretty(&outcome.body)?
    } else {
        serde_json::to_string(&outcome.body)?
    };
    println!("{}", text);
    info!(success = outcome.success, "Done");
    Ok(outcome)
}

/// Logs go to stderr; `RUST_LOG` wins over the configured level.
/// Loads the config under a stderr subscriber scoped to the load, so events
/// raised before [`init_tracing`] still reach the terminal.
fn load_config(path: Option<PathBuf>) -> ConfigResult<TallyConfig> {
    let bootstrap = tracing_subscriber::fmt()
        .with_env_filter(bootstrap_filter(|key| std::env::var(key).ok()))
        .with_writer(std::io::stderr)
        .with_target(false)
        .finish();
    tracing::subscriber::with_default(bootstrap, || TallyConfig::load(path))
}

/// `RUST_LOG`, then `TALLY_LOG`, then `warn`.
fn bootstrap_filter<F>(lookup: F) -> EnvFilter
where
    F: Fn(&str) -> Option<String>,
{
    ["RUST_LOG", "TALLY_LOG"]
        .iter()
        .filter_map(|key| lookup(key))
        .find_map(|directive| EnvFilter::try_new(directive).ok())
        .unwrap_or_else(|| EnvFilter::new(BOOTSTRAP_LEVEL))
}

fn init_tracing(config: &TallyConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.to_lowercase()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
