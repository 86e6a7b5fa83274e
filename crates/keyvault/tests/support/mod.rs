//! Fixture shared by the integration tests: in-memory database, in-memory
//! secret store, and every engine wired to them.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use common::protocol::Tier;
use keyvault::actor::{Actor, Role};
use keyvault::audit::{AuditLogEntry, Auditor};
use keyvault::crypto::KdfParams;
use keyvault::db::Database;
use keyvault::escrow::EscrowManager;
use keyvault::events::LogSink;
use keyvault::field::FieldEngine;
use keyvault::processor::{Processor, ProcessorSettings};
use keyvault::recovery::{RecoveryRequest, RecoveryWorkflow};
use keyvault::secret_store::MemorySecretStore;
use uuid::Uuid;
use zeroize::Zeroizing;

pub const OLD_CREDENTIAL: &[u8] = b"correct horse battery staple";
pub const NEW_CREDENTIAL: &[u8] = b"a brand new passphrase";

pub struct Fixture {
    pub db: Database,
    pub store: MemorySecretStore,
    pub field: FieldEngine<MemorySecretStore>,
    pub workflow: RecoveryWorkflow<MemorySecretStore>,
    pub processor: Processor<MemorySecretStore>,
    pub auditor: Auditor,
}

pub fn owner() -> Actor {
    Actor::new("owner-1", Role::Owner)
}

pub fn reviewer() -> Actor {
    Actor::new("reviewer-1", Role::Reviewer)
}

impl Fixture {
    pub async fn new(cooling_off: Duration) -> Self {
        let db = Database::open_in_memory().unwrap();
        let store = MemorySecretStore::new();
        let kdf = KdfParams::new(64, 1, 1);
        let escrow = EscrowManager::new(
            Arc::new(store.clone()),
            db.clone(),
            vec!["c1".into(), "c2".into(), "c3".into()],
            2,
        )
        .unwrap();
        escrow.ensure_custodian_keys().await.unwrap();
        let escrow = Arc::new(escrow);
        Self {
            field: FieldEngine::new(db.clone(), Arc::clone(&escrow), kdf),
            workflow: RecoveryWorkflow::new(
                db.clone(),
                Arc::new(store.clone()),
                Arc::new(LogSink),
                cooling_off,
                kdf,
            ),
            processor: Processor::new(
                db.clone(),
                Arc::new(store.clone()),
                escrow,
                Arc::new(LogSink),
                ProcessorSettings::default(),
            ),
            auditor: Auditor::new(db.clone()),
            db,
            store,
        }
    }

    pub async fn provision(&self, survey_id: &str, tier: Tier, at: DateTime<Utc>) {
        self.field
            .provision(&owner(), survey_id, tier, Zeroizing::new(OLD_CREDENTIAL.to_vec()), at)
            .await
            .unwrap();
    }

    /// Request and approve recovery of `survey_id` at `at`.
    pub async fn approved(&self, survey_id: &str, at: DateTime<Utc>) -> RecoveryRequest {
        let request = self
            .workflow
            .create(&owner(), survey_id, Zeroizing::new(NEW_CREDENTIAL.to_vec()), at)
            .await
            .unwrap();
        self.workflow.approve(&reviewer(), request.id, at).unwrap()
    }

    pub fn state(&self, id: Uuid) -> String {
        self.workflow.get(id).unwrap().view().state
    }

    pub fn audit_for(&self, target: &str, action: &str) -> Vec<AuditLogEntry> {
        self.auditor
            .entries_for(target)
            .unwrap()
            .into_iter()
            .filter(|e| e.action == action)
            .collect()
    }
}
