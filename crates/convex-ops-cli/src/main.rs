mod command_flows;
mod dispatch;
mod render;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::dispatch::run_cli;
use crate::render::{print_error, OutputMode};

#[derive(Parser, Debug)]
#[command(name = "convex-backend-ops")]
#[command(about = "Operations tool for a self-hosted Convex backend", long_about = None)]
struct Cli {
    /// Skip confirmation prompts.
    #[arg(short = 'y', long, global = true)]
    yes: bool,
    /// Suppress non-essential output.
    #[arg(short = 'q', long, global = true)]
    quiet: bool,
    /// Print results as JSON.
    #[arg(long, global = true)]
    json: bool,
    /// Settings file (TOML).
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Install the backend from a bundle directory.
    Install {
        #[arg(long, value_name = "DIR")]
        bundle: PathBuf,
    },
    /// Show installation and service status.
    Status,
    /// Upgrade to the version in a bundle, rolling back on failure.
    Upgrade {
        #[arg(long, value_name = "DIR")]
        bundle: PathBuf,
        #[arg(long)]
        force: bool,
    },
    /// Restore a backup; the most recent one when no version is given.
    Rollback { version: Option<String> },
    ListBackups,
    /// Delete all backend data, keeping configuration and backups.
    Reset,
    /// Remove the backend, its data, and its backups.
    Uninstall,
    Version,
    Completions { shell: Shell },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let output = OutputMode::from_flags(cli.json, cli.quiet);
    init_logging(output);

    match run_cli(cli, output) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            print_error(output, &err);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(output: OutputMode) {
    let default_level = if output.json || output.quiet {
        "warn"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .try_init();
}
