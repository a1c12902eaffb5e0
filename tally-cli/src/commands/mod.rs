//! CLI command implementations

pub mod account;
pub mod doctor;
pub mod status;
pub mod transfer;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use tally_core::{LedgerContext, RequestContext};
use tracing::debug;

/// Options shared by every command
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Act as this user; only their accounts can be used
    #[arg(long = "as", global = true, env = "TALLY_USER", value_name = "USER")]
    pub as_user: Option<String>,

    /// Abandon the command after this many milliseconds
    #[arg(long, global = true, value_name = "MS")]
    pub timeout_ms: Option<u64>,

    /// Log debug output to stderr
    #[arg(long, short, global = true)]
    pub verbose: bool,
}

impl GlobalArgs {
    /// Request context for a single command invocation
    pub fn request(&self) -> RequestContext {
        let ctx = match &self.as_user {
            Some(user) => RequestContext::for_principal(user.clone()),
            None => RequestContext::background(),
        };
        match self.timeout_ms {
            Some(ms) => ctx.with_timeout(Duration::from_millis(ms)),
            None => ctx,
        }
    }
}

/// Get the tally directory from environment or default
pub fn get_tally_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("TALLY_DIR") {
        return Ok(PathBuf::from(dir));
    }
    dirs::home_dir()
        .map(|home| home.join(".tally"))
        .context("Could not find home directory; set TALLY_DIR")
}

/// Open the ledger in the tally directory
pub fn get_context() -> Result<LedgerContext> {
    let tally_dir = get_tally_dir()?;

    std::fs::create_dir_all(&tally_dir)
        .with_context(|| format!("Failed to create tally directory: {:?}", tally_dir))?;

    debug!(dir = %tally_dir.display(), "opening ledger");
    LedgerContext::open(&tally_dir).context("Failed to open ledger")
}
