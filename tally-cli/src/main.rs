//! Tally CLI - a double-entry ledger in your terminal

use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod output;

use commands::{account, doctor, status, transfer, GlobalArgs};

/// Tally - move money between ledger accounts
#[derive(Parser)]
#[command(name = "tally", version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open, inspect and list accounts
    Account {
        #[command(subcommand)]
        command: account::AccountCommands,
    },

    /// Move funds from one account to another
    Transfer {
        /// Source account ID
        from: i64,
        /// Destination account ID
        to: i64,
        /// Amount in major units (e.g. 12.50)
        amount: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show ledger totals
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run ledger consistency checks
    Doctor {
        /// List the offending rows of failed checks
        #[arg(long)]
        details: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.global.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // JSON mode already printed the failure envelope
            if !e.is::<output::AlreadyReported>() {
                output::error(&format!("{:#}", e));
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let global = cli.global;
    match cli.command {
        Commands::Account { command } => account::run(&global, command),
        Commands::Transfer { from, to, amount, json } => {
            transfer::run(&global, from, to, &amount, json)
        }
        Commands::Status { json } => status::run(&global, json),
        Commands::Doctor { details, json } => doctor::run(&global, details, json),
    }
}
