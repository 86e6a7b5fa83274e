//! One reconciliation pass against the shared database and secret store.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use keyvault::db::Database;
use keyvault::escrow::EscrowManager;
use keyvault::events::{EventSink, LogSink};
use keyvault::processor::{Processor, ProcessorReport, ProcessorSettings, RunOptions};
use keyvault::secret_store::SecretStore;

/// Escrow roster the service was configured with.
#[derive(Debug, Clone)]
pub struct Roster {
    pub custodians: Vec<String>,
    pub threshold: u8,
}

/// Build a processor over `db` and `store`. Lifecycle events are logged.
///
/// # Errors
///
/// Returns an error if the roster is invalid.
pub fn processor<S: SecretStore>(
    db: Database,
    store: Arc<S>,
    roster: Roster,
    settings: ProcessorSettings,
) -> Result<Processor<S>> {
    let escrow = EscrowManager::new(Arc::clone(&store), db.clone(), roster.custodians, roster.threshold)
        .context("invalid escrow roster")?;
    let sink: Arc<dyn EventSink> = Arc::new(LogSink);
    Ok(Processor::new(db, store, Arc::new(escrow), sink, settings))
}

/// Run a single pass at `now`.
///
/// # Errors
///
/// Returns an error if the database or audit log fails; per-request
/// failures are counted in the report instead.
pub async fn once<S: SecretStore>(processor: &Processor<S>, now: DateTime<Utc>, dry_run: bool) -> Result<ProcessorReport> {
    processor
        .reconcile(now, RunOptions { dry_run })
        .await
        .context("reconciliation pass failed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use common::protocol::Tier;
    use keyvault::actor::{Actor, Role};
    use keyvault::crypto::KdfParams;
    use keyvault::field::{FieldContext, FieldEngine, KeyAccess};
    use keyvault::recovery::RecoveryWorkflow;
    use keyvault::secret_store::MemorySecretStore;
    use zeroize::Zeroizing;

    fn roster() -> Roster {
        Roster {
            custodians: vec!["c1".into(), "c2".into(), "c3".into()],
            threshold: 2,
        }
    }

    /// A provisioned ORGANIZATION survey with an approved recovery request.
    async fn approved_request(db: &Database, store: &MemorySecretStore, t0: DateTime<Utc>) {
        let kdf = KdfParams::new(64, 1, 1);
        let roster = roster();
        let escrow = EscrowManager::new(Arc::new(store.clone()), db.clone(), roster.custodians, roster.threshold).unwrap();
        escrow.ensure_custodian_keys().await.unwrap();
        let engine = FieldEngine::new(db.clone(), Arc::new(escrow), kdf);
        let owner = Actor::new("owner-1", Role::Owner);
        engine
            .provision(&owner, "s1", Tier::Organization, Zeroizing::new(b"old".to_vec()), t0)
            .await
            .unwrap();

        let workflow = RecoveryWorkflow::new(db.clone(), Arc::new(store.clone()), Arc::new(LogSink), Duration::hours(72), kdf);
        let request = workflow
            .create(&owner, "s1", Zeroizing::new(b"new".to_vec()), t0)
            .await
            .unwrap();
        workflow
            .approve(&Actor::new("rev-1", Role::Reviewer), request.id, t0)
            .unwrap();
    }

    #[tokio::test]
    async fn pass_completes_due_request() {
        let db = Database::open_in_memory().unwrap();
        let store = MemorySecretStore::new();
        let t0 = Utc::now();
        approved_request(&db, &store, t0).await;

        let p = processor(db.clone(), Arc::new(store.clone()), roster(), ProcessorSettings::default()).unwrap();

        let early = once(&p, t0 + Duration::hours(71), false).await.unwrap();
        assert_eq!(early, ProcessorReport::default());

        let report = once(&p, t0 + Duration::hours(73), false).await.unwrap();
        assert_eq!(report.completed, 1);
        assert!(!report.has_failures());

        let engine = FieldEngine::new(
            db.clone(),
            Arc::new(EscrowManager::new(Arc::new(store), db, roster().custodians, 2).unwrap()),
            KdfParams::new(64, 1, 1),
        );
        let session = engine
            .open(
                &Actor::new("owner-1", Role::Owner),
                "s1",
                KeyAccess::Credential(b"new"),
                t0 + Duration::hours(73),
            )
            .unwrap();
        let ctx = FieldContext::new("s1", "r1", "q1");
        let blob = session.encrypt(&ctx, b"answer").unwrap();
        assert_eq!(&session.decrypt(&ctx, &blob).unwrap()[..], b"answer");
    }

    #[tokio::test]
    async fn dry_run_changes_nothing() {
        let db = Database::open_in_memory().unwrap();
        let store = MemorySecretStore::new();
        let t0 = Utc::now();
        approved_request(&db, &store, t0).await;
        let p = processor(db, Arc::new(store), roster(), ProcessorSettings::default()).unwrap();

        let later = t0 + Duration::hours(73);
        let preview = once(&p, later, true).await.unwrap();
        assert!(preview.dry_run);
        assert_eq!((preview.due, preview.completed, preview.would_execute), (1, 0, 1));

        let report = once(&p, later, false).await.unwrap();
        assert_eq!(report.completed, 1);
    }

    #[tokio::test]
    async fn unreachable_store_is_deferred_then_failed() {
        let db = Database::open_in_memory().unwrap();
        let store = MemorySecretStore::new();
        let t0 = Utc::now();
        approved_request(&db, &store, t0).await;
        store.set_outage(true);

        let p = processor(db, Arc::new(store), roster(), ProcessorSettings::default()).unwrap();
        let mut failed = 0;
        for pass in 0..3 {
            let report = once(&p, t0 + Duration::hours(73) + Duration::minutes(pass), false).await.unwrap();
            assert_eq!(report.completed, 0);
            failed += report.failed;
        }
        assert_eq!(failed, 1);
    }
}
