//! Telemetry initialisation for the recovery cron job.
//!
//! The job uses a lightweight setup: structured JSON logs only, written to
//! stderr so that stdout carries nothing but the run report. No OTLP export;
//! the process lives for a single pass.

use anyhow::Result;
use tracing_subscriber::EnvFilter;

/// Initialise the tracing subscriber for the cron job.
///
/// `verbose` raises the default level to `debug`; `RUST_LOG` still wins.
///
/// # Errors
///
/// Returns an error if the subscriber has already been set.
pub fn init(log_level: &str, verbose: bool) -> Result<()> {
    let level = if verbose { "debug" } else { log_level };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialise recovery-cron tracing subscriber: {e}"))
}
