//! `recovery-cron`: scheduled entry point of the recovery time-delay processor.
//!
//! Startup sequence:
//! 1. Parse flags and load [`Config`] from the service environment.
//! 2. Initialise structured JSON logging.
//! 3. Open the database and log in to the secret store.
//! 4. Run one reconciliation pass, print the report, and exit.
//!
//! Exit status: 0 when no request reached FAILED, 1 when one did, 2 when
//! the pass could not run at all.

mod cli;
mod run;
mod telemetry;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use keyvault::config::Config;
use keyvault::db::Database;
use keyvault::processor::ProcessorReport;
use keyvault::secret_store::HttpSecretStore;
use tracing::{error, info};

use cli::Cli;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // -----------------------------------------------------------------------
    // 1. Configuration
    // -----------------------------------------------------------------------
    let cfg = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("ERROR: recovery-cron configuration invalid: {e:#}");
            return ExitCode::from(2);
        }
    };

    // -----------------------------------------------------------------------
    // 2. Telemetry
    // -----------------------------------------------------------------------
    if let Err(e) = telemetry::init(&cfg.log_level, cli.verbose) {
        eprintln!("ERROR: {e:#}");
        return ExitCode::from(2);
    }

    match execute(&cfg, cli.dry_run).await {
        Ok(report) => {
            println!("{}", serde_json::to_string(&report).unwrap_or_else(|_| "{}".into()));
            if report.has_failures() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            error!(error = %format!("{e:#}"), "recovery-cron pass aborted");
            ExitCode::from(2)
        }
    }
}

async fn execute(cfg: &Config, dry_run: bool) -> Result<ProcessorReport> {
    // -----------------------------------------------------------------------
    // 3. Stores
    // -----------------------------------------------------------------------
    let db = Database::open(&cfg.database_path)
        .with_context(|| format!("failed to open database at {}", cfg.database_path))?;
    let store = HttpSecretStore::new(cfg.secret_store_settings()).context("failed to build secret store client")?;
    store.login().await.context("secret store login failed")?;

    // -----------------------------------------------------------------------
    // 4. Reconciliation
    // -----------------------------------------------------------------------
    let processor = run::processor(
        db,
        Arc::new(store),
        run::Roster {
            custodians: cfg.escrow_custodians.clone(),
            threshold: cfg.escrow_threshold,
        },
        cfg.processor_settings(),
    )?;
    info!(dry_run, "starting reconciliation pass");
    run::once(&processor, Utc::now(), dry_run).await
}
