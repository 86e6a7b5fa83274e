//! Command-line flags. Everything else comes from the service environment.

use clap::Parser;

/// Run one reconciliation pass of the recovery time-delay processor.
///
/// Prints the pass report as JSON on stdout. Exits 1 if any request
/// reached FAILED during the pass.
#[derive(Debug, Parser)]
#[command(name = "recovery-cron", version)]
pub struct Cli {
    /// Report due requests without claiming or changing anything.
    #[arg(long)]
    pub dry_run: bool,

    /// Log at debug level.
    #[arg(long, short)]
    pub verbose: bool,
}
