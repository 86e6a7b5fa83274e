//! Human-driven recovery transitions: create, approve, reject, cancel.
//!
//! Each transition is guarded on the state it was computed from and writes
//! its audit entry in the same transaction, so a concurrent change rolls the
//! whole thing back instead of leaving a half-recorded transition.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use common::protocol::{RecoveryEventKind, Tier};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use super::state::{APPROVED, REQUESTED};
use super::{RecoveryRequest, TransitionError};
use crate::actor::{Actor, Role};
use crate::audit::{AuditAction, AuditError, AuditEvent, Auditor, Outcome};
use crate::crypto::{KdfError, KdfParams, KekDerivation};
use crate::db::{self, Database, StoreError};
use crate::events::{self, EventSink};
use crate::secret_store::{SecretStore, SecretStoreError};

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    PolicyViolation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Kdf(#[from] KdfError),

    #[error(transparent)]
    SecretStore(#[from] SecretStoreError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Audit(#[from] AuditError),

    #[error("key derivation task failed: {0}")]
    Task(String),
}

/// Drives recovery requests up to the point where the processor takes over.
pub struct RecoveryWorkflow<S> {
    db: Database,
    store: Arc<S>,
    sink: Arc<dyn EventSink>,
    auditor: Auditor,
    cooling_off: Duration,
    kdf_params: KdfParams,
}

impl<S> std::fmt::Debug for RecoveryWorkflow<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryWorkflow")
            .field("cooling_off", &self.cooling_off)
            .finish_non_exhaustive()
    }
}

impl<S: SecretStore> RecoveryWorkflow<S> {
    pub fn new(
        db: Database,
        store: Arc<S>,
        sink: Arc<dyn EventSink>,
        cooling_off: Duration,
        kdf_params: KdfParams,
    ) -> Self {
        Self {
            auditor: Auditor::new(db.clone()),
            db,
            store,
            sink,
            cooling_off,
            kdf_params,
        }
    }

    pub fn cooling_off(&self) -> Duration {
        self.cooling_off
    }

    /// Record a refused attempt and return `err`.
    fn deny(
        &self,
        actor: &Actor,
        action: AuditAction,
        target: &str,
        now: DateTime<Utc>,
        err: RecoveryError,
    ) -> RecoveryError {
        let event = AuditEvent::success(&actor.id, action, target, now)
            .with_outcome(Outcome::Denied)
            .with_detail(err.to_string());
        match self.auditor.record(event) {
            Ok(_) => err,
            Err(audit) => audit.into(),
        }
    }

    fn load(&self, id: Uuid) -> Result<RecoveryRequest, RecoveryError> {
        self.db
            .read(|c| db::recovery::get(c, id))?
            .ok_or_else(|| RecoveryError::NotFound(format!("recovery request {id}")))
    }

    pub fn get(&self, id: Uuid) -> Result<RecoveryRequest, RecoveryError> {
        self.load(id)
    }

    /// Load request `id` on behalf of `actor`: its requester, a reviewer or an operator.
    ///
    /// # Errors
    ///
    /// [`RecoveryError::Forbidden`] for anyone else.
    pub fn get_as(&self, actor: &Actor, id: Uuid) -> Result<RecoveryRequest, RecoveryError> {
        let request = self.load(id)?;
        if actor.id != request.requested_by && !matches!(actor.role, Role::Reviewer | Role::Operator) {
            return Err(RecoveryError::Forbidden(format!(
                "{} may not view recovery request {id}",
                actor.id
            )));
        }
        Ok(request)
    }

    pub fn list_for_survey(&self, survey_id: &str) -> Result<Vec<RecoveryRequest>, RecoveryError> {
        Ok(self.db.read(|c| db::recovery::list_for_survey(c, survey_id))?)
    }

    /// Open a recovery request. The new credential is derived to a pending
    /// KEK at once; the KEK goes to the secret store and only its recipe is
    /// persisted.
    ///
    /// # Errors
    ///
    /// - [`RecoveryError::Forbidden`] unless `actor` is an owner or reviewer.
    /// - [`RecoveryError::PolicyViolation`] for INDIVIDUAL surveys.
    /// - [`RecoveryError::Conflict`] if an open request already exists.
    pub async fn create(
        &self,
        actor: &Actor,
        survey_id: &str,
        new_credential: Zeroizing<Vec<u8>>,
        now: DateTime<Utc>,
    ) -> Result<RecoveryRequest, RecoveryError> {
        if !matches!(actor.role, Role::Owner | Role::Reviewer) {
            return Err(self.deny(
                actor,
                AuditAction::RecoveryRequested,
                survey_id,
                now,
                RecoveryError::Forbidden(format!("{} may not request recovery", actor.role.as_str())),
            ));
        }
        let survey = self
            .db
            .read(|c| db::keys::get_survey(c, survey_id))?
            .ok_or_else(|| RecoveryError::NotFound(format!("survey {survey_id}")))?;
        if survey.tier == Tier::Individual {
            return Err(self.deny(
                actor,
                AuditAction::RecoveryRequested,
                survey_id,
                now,
                RecoveryError::PolicyViolation(
                    "recovery is not available for zero-knowledge surveys".into(),
                ),
            ));
        }
        let has_escrow = self
            .db
            .read(|c| db::keys::get_key_record(c, survey_id))?
            .is_some_and(|r| r.escrow_wrapped_dek.is_some());
        if !has_escrow {
            return Err(RecoveryError::NotFound(format!("escrow material for survey {survey_id}")));
        }
        if let Some(open) = self.db.read(|c| db::recovery::open_for_survey(c, survey_id))? {
            return Err(RecoveryError::Conflict(format!("recovery request {open} is already open")));
        }
        if new_credential.is_empty() {
            return Err(KdfError::EmptySecret.into());
        }

        let derivation = KekDerivation::fresh(self.kdf_params);
        let kek = {
            let derivation = derivation.clone();
            tokio::task::spawn_blocking(move || derivation.derive(&new_credential))
                .await
                .map_err(|e| RecoveryError::Task(e.to_string()))??
        };

        let request = RecoveryRequest::new(survey_id, &actor.id, now, derivation);
        self.store
            .create_secret(&request.pending_kek_path(), kek.material().expose())
            .await?;
        drop(kek);

        let committed = self.db.write(|tx| {
            if let Some(open) = db::recovery::open_for_survey(tx, survey_id)? {
                return Err(RecoveryError::Conflict(format!(
                    "recovery request {open} is already open"
                )));
            }
            db::recovery::insert(tx, &request)?;
            Auditor::record_tx(
                tx,
                AuditEvent::success(&actor.id, AuditAction::RecoveryRequested, survey_id, now)
                    .with_detail(request.id.to_string()),
            )?;
            Ok(())
        });
        if let Err(err) = committed {
            self.discard_pending_kek(request.id).await;
            return Err(err);
        }
        info!(request_id = %request.id, survey_id, "recovery requested");
        Ok(request)
    }

    /// `REQUESTED → APPROVED`, scheduling execution after the cooling-off period.
    pub fn approve(&self, actor: &Actor, id: Uuid, now: DateTime<Utc>) -> Result<RecoveryRequest, RecoveryError> {
        let mut request = self.load(id)?;
        self.check_reviewer(actor, &request, AuditAction::RecoveryApproved, now)?;
        let next = request.state.approve(&actor.id, now, self.cooling_off)?;
        let target = id.to_string();
        self.db.write(|tx| {
            if !db::recovery::update_state(tx, id, REQUESTED, &next)? {
                return Err(RecoveryError::Conflict(format!("recovery request {id} changed concurrently")));
            }
            let scheduled = next
                .approval()
                .map(|a| a.scheduled_execution_at.to_rfc3339())
                .unwrap_or_default();
            Auditor::record_tx(
                tx,
                AuditEvent::success(&actor.id, AuditAction::RecoveryApproved, &target, now)
                    .with_detail(format!("scheduled {scheduled}")),
            )?;
            Ok(())
        })?;
        request.state = next;
        info!(request_id = %id, "recovery approved");
        Ok(request)
    }

    /// `REQUESTED → REJECTED`. The requester is notified with `reason`.
    pub async fn reject(
        &self,
        actor: &Actor,
        id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<RecoveryRequest, RecoveryError> {
        let mut request = self.load(id)?;
        self.check_reviewer(actor, &request, AuditAction::RecoveryRejected, now)?;
        let next = request.state.reject(&actor.id, now, reason)?;
        request.state = next;
        let target = id.to_string();
        self.db.write(|tx| {
            if !db::recovery::update_state(tx, id, REQUESTED, &request.state)? {
                return Err(RecoveryError::Conflict(format!("recovery request {id} changed concurrently")));
            }
            Auditor::record_tx(
                tx,
                AuditEvent::success(&actor.id, AuditAction::RecoveryRejected, &target, now),
            )?;
            events::enqueue(tx, &events::event_for(&request, RecoveryEventKind::Rejected, now))?;
            Ok(())
        })?;
        info!(request_id = %id, "recovery rejected");
        self.discard_pending_kek(id).await;
        self.dispatch();
        Ok(request)
    }

    /// `APPROVED → CANCELLED`, before the scheduled time and while no
    /// processor holds the request.
    pub async fn cancel(&self, actor: &Actor, id: Uuid, now: DateTime<Utc>) -> Result<RecoveryRequest, RecoveryError> {
        let mut request = self.load(id)?;
        let target = id.to_string();
        if actor.id != request.requested_by && actor.role != Role::Reviewer {
            return Err(self.deny(
                actor,
                AuditAction::RecoveryCancelled,
                &target,
                now,
                RecoveryError::Forbidden("only the requester or a reviewer may cancel".into()),
            ));
        }
        let next = request.state.cancel(&actor.id, now)?;
        self.db.write(|tx| {
            if !db::recovery::cancel_unclaimed(tx, id, &next, now)? {
                return Err(RecoveryError::Conflict(format!(
                    "recovery request {id} is no longer {APPROVED} and cancellable"
                )));
            }
            Auditor::record_tx(
                tx,
                AuditEvent::success(&actor.id, AuditAction::RecoveryCancelled, &target, now),
            )?;
            Ok(())
        })?;
        request.state = next;
        info!(request_id = %id, "recovery cancelled");
        self.discard_pending_kek(id).await;
        Ok(request)
    }

    fn check_reviewer(
        &self,
        actor: &Actor,
        request: &RecoveryRequest,
        action: AuditAction,
        now: DateTime<Utc>,
    ) -> Result<(), RecoveryError> {
        let refusal = if actor.role != Role::Reviewer {
            Some("only a reviewer may decide on recovery")
        } else if actor.id == request.requested_by {
            Some("a requester may not review their own request")
        } else {
            None
        };
        match refusal {
            Some(msg) => Err(self.deny(
                actor,
                action,
                &request.id.to_string(),
                now,
                RecoveryError::Forbidden(msg.into()),
            )),
            None => Ok(()),
        }
    }

    async fn discard_pending_kek(&self, id: Uuid) {
        if let Err(err) = self.store.delete_secret(&super::pending_kek_path(id)).await {
            warn!(request_id = %id, error = %err, "failed to delete pending KEK");
        }
    }

    fn dispatch(&self) {
        if let Err(err) = events::dispatch_pending(&self.db, self.sink.as_ref()) {
            warn!(error = %err, "event dispatch failed");
        }
    }
}
