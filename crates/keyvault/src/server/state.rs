//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use chrono::Duration;

use crate::crypto::KdfParams;
use crate::db::Database;
use crate::escrow::{EscrowManager, UnsealSessions};
use crate::events::EventSink;
use crate::field::FieldEngine;
use crate::recovery::RecoveryWorkflow;
use crate::secret_store::SecretStore;

use super::middleware::ActorHeaders;

/// Tunables the HTTP layer needs besides the engines themselves.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub headers: ActorHeaders,
    pub cooling_off: Duration,
    pub kdf_params: KdfParams,
    pub unseal_session_ttl: Duration,
    pub master_session_ttl: Duration,
}

/// Application state shared across all request handlers.
///
/// Every field is `Arc`-backed so Axum can clone the state per request
/// without copying the engines.
pub struct AppState<S> {
    pub db: Database,
    pub field: Arc<FieldEngine<S>>,
    pub recovery: Arc<RecoveryWorkflow<S>>,
    pub escrow: Arc<EscrowManager<S>>,
    /// Open unseal sessions; they live only in this process.
    pub sessions: Arc<UnsealSessions>,
    pub headers: Arc<ActorHeaders>,
    pub unseal_session_ttl: Duration,
    pub master_session_ttl: Duration,
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            field: Arc::clone(&self.field),
            recovery: Arc::clone(&self.recovery),
            escrow: Arc::clone(&self.escrow),
            sessions: Arc::clone(&self.sessions),
            headers: Arc::clone(&self.headers),
            unseal_session_ttl: self.unseal_session_ttl,
            master_session_ttl: self.master_session_ttl,
        }
    }
}

impl<S: SecretStore> AppState<S> {
    pub fn new(
        db: Database,
        store: Arc<S>,
        escrow: Arc<EscrowManager<S>>,
        sink: Arc<dyn EventSink>,
        settings: ServerSettings,
    ) -> Self {
        Self {
            field: Arc::new(FieldEngine::new(db.clone(), Arc::clone(&escrow), settings.kdf_params)),
            recovery: Arc::new(RecoveryWorkflow::new(
                db.clone(),
                store,
                sink,
                settings.cooling_off,
                settings.kdf_params,
            )),
            escrow,
            sessions: Arc::new(UnsealSessions::new()),
            headers: Arc::new(settings.headers),
            unseal_session_ttl: settings.unseal_session_ttl,
            master_session_ttl: settings.master_session_ttl,
            db,
        }
    }
}
