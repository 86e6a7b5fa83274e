//! The time-delay processor: completes approved recovery requests once
//! their cooling-off period has elapsed.
//!
//! [`Processor::reconcile`] is one idempotent pass. Each due request is
//! claimed with a conditional update before any work starts, so
//! overlapping passes never execute the same request twice. The key record
//! replacement, the `COMPLETED` transition, the audit entries and the
//! lifecycle event commit in one transaction; a pass that crashes before it
//! leaves the request `APPROVED` with an expiring claim.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use common::protocol::RecoveryEventKind;
use secrecy::ExposeSecret;
use serde::Serialize;
use thiserror::Error;
use tokio::time;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::actor::Actor;
use crate::audit::{AuditAction, AuditError, AuditEvent, Auditor, Outcome};
use crate::crypto::Kek;
use crate::db::{self, Database, StoreError};
use crate::dek::{unwrap_dek, wrap_dek, SurveyKeyRecord, WrapContext};
use crate::escrow::{EscrowError, EscrowManager};
use crate::events::{self, EventSink};
use crate::recovery::{pending_kek_path, Claim, RecoveryRequest, TransitionError};
use crate::secret_store::{SecretStore, SecretStoreError};

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Audit(#[from] AuditError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// Another processor took over the request after our lease expired.
    #[error("lost the claim on recovery request {0}")]
    LostClaim(Uuid),

    #[error("recovery request {0} disappeared after being claimed")]
    Vanished(Uuid),
}

#[derive(Debug, Clone, Copy)]
pub struct ProcessorSettings {
    /// Failed attempts after which a request moves to `FAILED`.
    pub max_attempts: u32,
    /// Lease taken on a request while it is executed.
    pub claim_ttl: Duration,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            claim_ttl: Duration::minutes(10),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Report what is due without claiming or changing anything.
    pub dry_run: bool,
}

/// Counts from one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessorReport {
    pub due: usize,
    pub completed: usize,
    pub failed: usize,
    /// Transient failure below the attempt limit; retried next pass.
    pub deferred: usize,
    /// Claimed elsewhere, or changed state before it could be claimed.
    pub skipped: usize,
    /// Dry run only: due and unclaimed, so a live pass would execute it.
    pub would_execute: usize,
    pub dry_run: bool,
}

impl ProcessorReport {
    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestOutcome {
    Completed,
    Failed,
    Deferred,
    Skipped,
    WouldExecute,
}

/// Why an execution attempt did not produce a new key record.
#[derive(Debug)]
enum Failure {
    Transient(String),
    Permanent(String),
}

impl Failure {
    fn from_secret_store(err: SecretStoreError) -> Self {
        if err.is_transient() {
            Failure::Transient(err.to_string())
        } else {
            Failure::Permanent(err.to_string())
        }
    }

    fn from_escrow(err: EscrowError) -> Self {
        match err {
            EscrowError::SecretStore(e) => Self::from_secret_store(e),
            EscrowError::Store(e) => Failure::Transient(e.to_string()),
            other => Failure::Permanent(other.to_string()),
        }
    }

    fn reason(&self) -> &str {
        match self {
            Failure::Transient(r) | Failure::Permanent(r) => r,
        }
    }
}

enum Commit {
    Done,
    RecordChanged,
}

pub struct Processor<S> {
    db: Database,
    store: Arc<S>,
    escrow: Arc<EscrowManager<S>>,
    sink: Arc<dyn EventSink>,
    settings: ProcessorSettings,
}

impl<S> std::fmt::Debug for Processor<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl<S: SecretStore> Processor<S> {
    pub fn new(
        db: Database,
        store: Arc<S>,
        escrow: Arc<EscrowManager<S>>,
        sink: Arc<dyn EventSink>,
        settings: ProcessorSettings,
    ) -> Self {
        Self {
            db,
            store,
            escrow,
            sink,
            settings,
        }
    }

    /// Advance every request due at `now`.
    ///
    /// # Errors
    ///
    /// Returns an error only when the relational store or the audit log
    /// fails; per-request failures are counted in the report.
    pub async fn reconcile(&self, now: DateTime<Utc>, opts: RunOptions) -> Result<ProcessorReport, ProcessorError> {
        let due = self.db.read(|c| db::recovery::list_due(c, now))?;
        let mut report = ProcessorReport {
            due: due.len(),
            dry_run: opts.dry_run,
            ..ProcessorReport::default()
        };

        for id in due {
            let outcome = if opts.dry_run {
                self.preview(id, now)?
            } else {
                match self.process(id, now).await {
                    Err(ProcessorError::LostClaim(id)) => {
                        warn!(request_id = %id, "claim lost mid-execution; leaving request to its new holder");
                        RequestOutcome::Skipped
                    }
                    other => other?,
                }
            };
            match outcome {
                RequestOutcome::Completed => report.completed += 1,
                RequestOutcome::Failed => report.failed += 1,
                RequestOutcome::Deferred => report.deferred += 1,
                RequestOutcome::Skipped => report.skipped += 1,
                RequestOutcome::WouldExecute => report.would_execute += 1,
            }
        }

        if !opts.dry_run {
            if let Err(err) = events::dispatch_pending(&self.db, self.sink.as_ref()) {
                warn!(error = %err, "event dispatch failed");
            }
        }
        info!(
            due = report.due,
            completed = report.completed,
            failed = report.failed,
            deferred = report.deferred,
            skipped = report.skipped,
            would_execute = report.would_execute,
            dry_run = report.dry_run,
            "reconciliation pass finished"
        );
        Ok(report)
    }

    fn preview(&self, id: Uuid, now: DateTime<Utc>) -> Result<RequestOutcome, ProcessorError> {
        let request = self.db.read(|c| db::recovery::get(c, id))?.ok_or(ProcessorError::Vanished(id))?;
        if request.is_claimed(now) {
            return Ok(RequestOutcome::Skipped);
        }
        info!(request_id = %id, survey_id = %request.survey_id, attempts = request.attempts, "would execute recovery");
        Ok(RequestOutcome::WouldExecute)
    }

    async fn process(&self, id: Uuid, now: DateTime<Utc>) -> Result<RequestOutcome, ProcessorError> {
        let claim = Claim {
            token: Uuid::new_v4(),
            until: now + self.settings.claim_ttl,
        };
        if !self.db.write(|tx| db::recovery::claim(tx, id, claim, now))? {
            debug!(request_id = %id, "request already claimed or no longer due");
            return Ok(RequestOutcome::Skipped);
        }

        let request = match self.db.read(|c| db::recovery::get(c, id)) {
            Ok(Some(r)) => r,
            Ok(None) => return Err(ProcessorError::Vanished(id)),
            Err(err) => {
                self.release(id, claim);
                return Err(err.into());
            }
        };

        match self.execute(&request, now).await {
            Ok(Ok((record, expected_version))) => {
                match self.commit(&request, claim, &record, expected_version, now) {
                    Ok(Commit::Done) => {
                        info!(request_id = %id, survey_id = %request.survey_id, wrap_version = record.wrap_version, "recovery completed");
                        self.discard_pending_kek(id).await;
                        Ok(RequestOutcome::Completed)
                    }
                    Ok(Commit::RecordChanged) => self.record_failure(
                        &request,
                        claim,
                        Failure::Permanent("key record changed during recovery".into()),
                        now,
                    )
                    .await,
                    Err(ProcessorError::LostClaim(id)) => Err(ProcessorError::LostClaim(id)),
                    Err(err) => {
                        self.release(id, claim);
                        Err(err)
                    }
                }
            }
            Ok(Err(failure)) => self.record_failure(&request, claim, failure, now).await,
            Err(err) => {
                self.release(id, claim);
                Err(err)
            }
        }
    }

    /// Re-wrap the survey DEK under the pending KEK. No database lock is
    /// held while the secret store is contacted.
    async fn execute(
        &self,
        request: &RecoveryRequest,
        now: DateTime<Utc>,
    ) -> Result<Result<(SurveyKeyRecord, u32), Failure>, ProcessorError> {
        let survey_id = request.survey_id.as_str();
        let Some(record) = self.db.read(|c| db::keys::get_key_record(c, survey_id))? else {
            return Ok(Err(Failure::Permanent(format!("key record for survey {survey_id} not found"))));
        };
        let Some(escrow_wrapped) = record.escrow_wrapped_dek.as_ref() else {
            return Ok(Err(Failure::Permanent(format!("survey {survey_id} has no escrow wrap"))));
        };
        let shares = self.db.read(|c| db::keys::escrow_shares(c, survey_id))?;

        let escrow_kek = match self.escrow.recover_kek(&shares).await {
            Ok(k) => k,
            Err(err) => return Ok(Err(Failure::from_escrow(err))),
        };
        let pending_kek = match self.store.get_secret(&pending_kek_path(request.id)).await {
            Ok(secret) => match Kek::from_slice(secret.expose_secret()) {
                Ok(k) => k,
                Err(err) => return Ok(Err(Failure::Permanent(format!("pending KEK is malformed: {err}")))),
            },
            Err(err) => return Ok(Err(Failure::from_secret_store(err))),
        };

        let dek = match unwrap_dek(escrow_wrapped, &escrow_kek, record.escrow_context()) {
            Ok(dek) => dek,
            Err(err) => return Ok(Err(Failure::Permanent(format!("escrow unwrap failed: {err}")))),
        };
        let wrap_version = record.wrap_version + 1;
        let wrapped_dek = match wrap_dek(&dek, &pending_kek, WrapContext::new(survey_id, wrap_version)) {
            Ok(w) => w,
            Err(err) => return Ok(Err(Failure::Permanent(format!("re-wrap failed: {err}")))),
        };
        let replacement = SurveyKeyRecord {
            survey_id: survey_id.to_owned(),
            wrapped_dek,
            wrap_version,
            kek_derivation: request.pending_kek_derivation.clone(),
            escrow_wrapped_dek: record.escrow_wrapped_dek.clone(),
            created_at: now,
        };
        Ok(Ok((replacement, record.wrap_version)))
    }

    fn commit(
        &self,
        request: &RecoveryRequest,
        claim: Claim,
        record: &SurveyKeyRecord,
        expected_version: u32,
        now: DateTime<Utc>,
    ) -> Result<Commit, ProcessorError> {
        let completed = request.state.complete(now)?;
        let mut done = request.clone();
        done.state = completed;
        let actor = Actor::system();
        let target = request.id.to_string();

        self.db.write(|tx| {
            if !db::keys::replace_key_record(tx, record, expected_version)? {
                return Ok(Commit::RecordChanged);
            }
            if !db::recovery::finish_claimed(tx, request.id, claim.token, &done.state, false)? {
                return Err(ProcessorError::LostClaim(request.id));
            }
            Auditor::record_tx(
                tx,
                AuditEvent::success(&actor.id, AuditAction::DekRewrap, &request.survey_id, now)
                    .with_detail(format!("wrap_version {}", record.wrap_version)),
            )?;
            Auditor::record_tx(
                tx,
                AuditEvent::success(&actor.id, AuditAction::RecoveryCompleted, &target, now),
            )?;
            events::enqueue(tx, &events::event_for(&done, RecoveryEventKind::Completed, now))?;
            Ok(Commit::Done)
        })
    }

    async fn record_failure(
        &self,
        request: &RecoveryRequest,
        claim: Claim,
        failure: Failure,
        now: DateTime<Utc>,
    ) -> Result<RequestOutcome, ProcessorError> {
        let id = request.id;
        let target = id.to_string();
        let actor = Actor::system();
        let attempts = request.attempts + 1;
        let max = self.settings.max_attempts;

        if let Failure::Transient(reason) = &failure {
            if attempts < max {
                self.db.write(|tx| {
                    if !db::recovery::release_claim(tx, id, claim.token, true)? {
                        return Err(ProcessorError::LostClaim(id));
                    }
                    Auditor::record_tx(
                        tx,
                        AuditEvent::success(&actor.id, AuditAction::RecoveryAttemptFailed, &target, now)
                            .with_outcome(Outcome::Failure)
                            .with_detail(format!("attempt {attempts} of {max}: {reason}")),
                    )?;
                    Ok(())
                })?;
                warn!(request_id = %id, attempts, max_attempts = max, reason = %reason, "recovery attempt failed; will retry");
                return Ok(RequestOutcome::Deferred);
            }
        }

        let reason = failure.reason();
        let failed = request.state.fail(now, reason)?;
        self.db.write(|tx| {
            if !db::recovery::finish_claimed(tx, id, claim.token, &failed, true)? {
                return Err(ProcessorError::LostClaim(id));
            }
            Auditor::record_tx(
                tx,
                AuditEvent::success(&actor.id, AuditAction::RecoveryFailed, &target, now)
                    .with_outcome(Outcome::Failure)
                    .with_detail(reason),
            )?;
            Ok(())
        })?;
        error!(
            alert = "recovery_failed",
            request_id = %id,
            survey_id = %request.survey_id,
            attempts,
            reason = %reason,
            "recovery failed; operator attention required"
        );
        self.discard_pending_kek(id).await;
        Ok(RequestOutcome::Failed)
    }

    fn release(&self, id: Uuid, claim: Claim) {
        if let Err(err) = self.db.write(|tx| db::recovery::release_claim(tx, id, claim.token, false)) {
            warn!(request_id = %id, error = %err, "failed to release claim; it will expire");
        }
    }

    async fn discard_pending_kek(&self, id: Uuid) {
        if let Err(err) = self.store.delete_secret(&pending_kek_path(id)).await {
            warn!(request_id = %id, error = %err, "failed to delete pending KEK");
        }
    }
}

/// Run [`Processor::reconcile`] every `interval` inside the service.
pub fn schedule_task<S: SecretStore>(processor: Arc<Processor<S>>, interval: std::time::Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = processor.reconcile(Utc::now(), RunOptions::default()).await {
                error!(error = %e, "reconciliation pass aborted");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::Role;
    use crate::events::LogSink;
    use crate::recovery::{RecoveryState, RecoveryWorkflow};
    use crate::secret_store::MemorySecretStore;
    use crate::testutil;
    use common::protocol::Tier;
    use zeroize::Zeroizing;

    struct Fixture {
        db: Database,
        store: MemorySecretStore,
        workflow: RecoveryWorkflow<MemorySecretStore>,
        processor: Processor<MemorySecretStore>,
    }

    async fn fixture() -> Fixture {
        let db = Database::open_in_memory().unwrap();
        let store = MemorySecretStore::new();
        testutil::provision(&db, &store, "s1", Tier::Organization).await;
        let escrow = testutil::escrow(&db, &store).await;
        let workflow = RecoveryWorkflow::new(
            db.clone(),
            Arc::new(store.clone()),
            Arc::new(LogSink),
            Duration::hours(24),
            testutil::fast_kdf(),
        );
        let processor = Processor::new(
            db.clone(),
            Arc::new(store.clone()),
            escrow,
            Arc::new(LogSink),
            ProcessorSettings::default(),
        );
        Fixture {
            db,
            store,
            workflow,
            processor,
        }
    }

    async fn approved(f: &Fixture, t0: DateTime<Utc>) -> Uuid {
        let owner = Actor::new("owner-1", Role::Owner);
        let req = f
            .workflow
            .create(&owner, "s1", Zeroizing::new(b"new passphrase".to_vec()), t0)
            .await
            .unwrap();
        f.workflow
            .approve(&Actor::new("rev-1", Role::Reviewer), req.id, t0)
            .unwrap();
        req.id
    }

    fn state(f: &Fixture, id: Uuid) -> RecoveryState {
        f.db.read(|c| db::recovery::get(c, id)).unwrap().unwrap().state
    }

    #[tokio::test]
    async fn nothing_happens_before_schedule() {
        let f = fixture().await;
        let t0 = Utc::now();
        let id = approved(&f, t0).await;
        let report = f.processor.reconcile(t0 + Duration::hours(1), RunOptions::default()).await.unwrap();
        assert_eq!(report.due, 0);
        assert_eq!(state(&f, id).name(), "APPROVED");
    }

    #[tokio::test]
    async fn completes_once_due() {
        let f = fixture().await;
        let t0 = Utc::now();
        let id = approved(&f, t0).await;
        let run_at = t0 + Duration::hours(25);
        let report = f.processor.reconcile(run_at, RunOptions::default()).await.unwrap();
        assert_eq!(report.completed, 1);
        assert!(!report.has_failures());

        let RecoveryState::Completed(c) = state(&f, id) else {
            panic!("not completed");
        };
        assert!(c.completed_at() >= c.approval().scheduled_execution_at);
        let rec = f.db.read(|c| db::keys::get_key_record(c, "s1")).unwrap().unwrap();
        assert_eq!(rec.wrap_version, 2);
        assert!(!f.store.contains(&pending_kek_path(id)));

        // Second pass is a no-op.
        let again = f.processor.reconcile(run_at, RunOptions::default()).await.unwrap();
        assert_eq!(again, ProcessorReport::default());
    }

    #[tokio::test]
    async fn dry_run_changes_nothing() {
        let f = fixture().await;
        let t0 = Utc::now();
        let id = approved(&f, t0).await;
        let report = f
            .processor
            .reconcile(t0 + Duration::hours(25), RunOptions { dry_run: true })
            .await
            .unwrap();
        assert_eq!(report.due, 1);
        assert_eq!(report.completed, 0);
        assert_eq!(report.would_execute, 1);
        assert_eq!(report.deferred, 0);
        assert!(report.dry_run);
        assert_eq!(state(&f, id).name(), "APPROVED");
    }

    #[tokio::test]
    async fn transient_failures_are_bounded() {
        let f = fixture().await;
        let t0 = Utc::now();
        let id = approved(&f, t0).await;
        f.store.set_outage(true);

        let run_at = t0 + Duration::hours(25);
        for pass in 1..=2 {
            let r = f.processor.reconcile(run_at, RunOptions::default()).await.unwrap();
            assert_eq!(r.deferred, 1, "pass {pass}");
            assert_eq!(state(&f, id).name(), "APPROVED");
        }
        let r = f.processor.reconcile(run_at, RunOptions::default()).await.unwrap();
        assert_eq!(r.failed, 1);
        assert_eq!(state(&f, id).name(), "FAILED");

        // Never completes afterwards, even once the store recovers.
        f.store.set_outage(false);
        let r = f.processor.reconcile(run_at + Duration::hours(1), RunOptions::default()).await.unwrap();
        assert_eq!(r.due, 0);
        assert_eq!(state(&f, id).name(), "FAILED");
    }

    #[tokio::test]
    async fn missing_pending_kek_fails_immediately() {
        let f = fixture().await;
        let t0 = Utc::now();
        let id = approved(&f, t0).await;
        f.store.delete_secret(&pending_kek_path(id)).await.unwrap();
        let r = f.processor.reconcile(t0 + Duration::hours(25), RunOptions::default()).await.unwrap();
        assert_eq!(r.failed, 1);
        assert!(r.has_failures());
        let entries = Auditor::new(f.db.clone()).entries_for(&id.to_string()).unwrap();
        assert_eq!(entries.last().unwrap().action, "recovery.failed");
    }

    #[tokio::test]
    async fn claimed_request_is_skipped() {
        let f = fixture().await;
        let t0 = Utc::now();
        let id = approved(&f, t0).await;
        let run_at = t0 + Duration::hours(25);
        let other = Claim {
            token: Uuid::new_v4(),
            until: run_at + Duration::minutes(5),
        };
        assert!(f.db.write(|tx| db::recovery::claim(tx, id, other, run_at)).unwrap());
        let r = f.processor.reconcile(run_at, RunOptions::default()).await.unwrap();
        assert_eq!(r.skipped, 1);
        assert_eq!(state(&f, id).name(), "APPROVED");
    }
}
