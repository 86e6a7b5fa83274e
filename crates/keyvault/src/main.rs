//! `keyvault`: service binary entry point.
//!
//! Startup sequence:
//! 1. Load and validate [`Config`] from environment variables.
//! 2. Initialise the telemetry pipeline (tracing + optional OTLP export).
//! 3. Open the relational store.
//! 4. Log in to the secret store with AppRole.
//! 5. Make sure every escrow custodian has a share-wrapping key.
//! 6. Optionally spawn the embedded time-delay processor.
//! 7. Build the Axum router, sweep expired unseal sessions in the background
//!    and start the HTTP server.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use keyvault::config::Config;
use keyvault::db::Database;
use keyvault::escrow::{session, EscrowManager};
use keyvault::events::LogSink;
use keyvault::processor::{self, Processor};
use keyvault::secret_store::HttpSecretStore;
use keyvault::server::{self, middleware::ActorHeaders, AppState, ServerSettings};
use keyvault::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    // -----------------------------------------------------------------------
    // 1. Configuration
    // -----------------------------------------------------------------------
    let cfg = Config::from_env().map_err(|e| {
        // Telemetry is not yet up; write to stderr directly.
        eprintln!("ERROR: configuration invalid: {e:#}");
        e
    })?;

    // -----------------------------------------------------------------------
    // 2. Telemetry
    // -----------------------------------------------------------------------
    telemetry::init_telemetry(cfg.otel_exporter_otlp_endpoint.as_deref(), &cfg.log_level)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen_port = cfg.listen_port,
        processor_embedded = cfg.processor_embedded,
        "keyvault starting"
    );

    // -----------------------------------------------------------------------
    // 3. Relational store
    // -----------------------------------------------------------------------
    let db = Database::open(&cfg.database_path)
        .with_context(|| format!("failed to open database at {}", cfg.database_path))?;

    // -----------------------------------------------------------------------
    // 4. Secret store
    // -----------------------------------------------------------------------
    let store = HttpSecretStore::new(cfg.secret_store_settings()).context("failed to build secret store client")?;
    store.login().await.context("secret store login failed")?;
    let store = Arc::new(store);

    // -----------------------------------------------------------------------
    // 5. Escrow custodians
    // -----------------------------------------------------------------------
    let escrow = EscrowManager::new(
        Arc::clone(&store),
        db.clone(),
        cfg.escrow_custodians.clone(),
        cfg.escrow_threshold,
    )
    .context("invalid escrow roster")?;
    let created = escrow
        .ensure_custodian_keys()
        .await
        .context("failed to provision custodian keys")?;
    info!(created, threshold = cfg.escrow_threshold, "escrow custodians ready");
    let escrow = Arc::new(escrow);

    // -----------------------------------------------------------------------
    // 6. Background tasks
    // -----------------------------------------------------------------------
    let sink = Arc::new(LogSink);
    let _processor = cfg.processor_embedded.then(|| {
        let processor = Arc::new(Processor::new(
            db.clone(),
            Arc::clone(&store),
            Arc::clone(&escrow),
            sink.clone(),
            cfg.processor_settings(),
        ));
        processor::schedule_task(processor, Duration::from_secs(cfg.processor_interval_secs))
    });

    // -----------------------------------------------------------------------
    // 7. HTTP server
    // -----------------------------------------------------------------------
    let settings = ServerSettings {
        headers: ActorHeaders::new(&cfg.actor_header_name, &cfg.role_header_name)
            .context("invalid identity header name")?,
        cooling_off: cfg.cooling_off(),
        kdf_params: cfg.kdf_params(),
        unseal_session_ttl: cfg.unseal_session_ttl(),
        master_session_ttl: cfg.master_session_ttl(),
    };
    let state = AppState::new(db, store, escrow, sink, settings);
    let _sweeper = session::sweep_task(Arc::clone(&state.sessions), session::SWEEP_INTERVAL);
    let router = server::router::build(state);

    let addr: std::net::SocketAddr = ([0, 0, 0, 0], cfg.listen_port).into();
    info!(addr = %addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, router).await?;

    Ok(())
}
