//! Shared fixtures for unit tests.

use std::sync::Arc;

use chrono::Utc;
use common::protocol::Tier;
use zeroize::Zeroizing;

use crate::actor::{Actor, Role};
use crate::crypto::KdfParams;
use crate::db::Database;
use crate::escrow::EscrowManager;
use crate::field::FieldEngine;
use crate::secret_store::MemorySecretStore;

pub(crate) const OWNER_CREDENTIAL: &[u8] = b"old passphrase";

/// Argon2 at its minimum cost.
pub(crate) fn fast_kdf() -> KdfParams {
    KdfParams::new(64, 1, 1)
}

pub(crate) async fn escrow(db: &Database, store: &MemorySecretStore) -> Arc<EscrowManager<MemorySecretStore>> {
    let mgr = EscrowManager::new(
        Arc::new(store.clone()),
        db.clone(),
        vec!["c1".into(), "c2".into(), "c3".into()],
        2,
    )
    .unwrap();
    mgr.ensure_custodian_keys().await.unwrap();
    Arc::new(mgr)
}

/// Provision `survey_id` with [`OWNER_CREDENTIAL`].
pub(crate) async fn provision(db: &Database, store: &MemorySecretStore, survey_id: &str, tier: Tier) {
    let engine = FieldEngine::new(db.clone(), escrow(db, store).await, fast_kdf());
    engine
        .provision(
            &Actor::new("owner-1", Role::Owner),
            survey_id,
            tier,
            Zeroizing::new(OWNER_CREDENTIAL.to_vec()),
            Utc::now(),
        )
        .await
        .unwrap();
}

/// Make every later audit insert fail, as an unwritable audit log would.
pub(crate) fn refuse_audit_writes(db: &Database) {
    db.write(|tx| {
        tx.execute_batch(
            "CREATE TRIGGER audit_log_refuse BEFORE INSERT ON audit_log
             BEGIN SELECT RAISE(ABORT, 'audit log unavailable'); END;",
        )
        .map_err(crate::db::StoreError::from)
    })
    .unwrap();
}
