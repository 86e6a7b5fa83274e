//! The persisted recovery request.

use chrono::{DateTime, Utc};
use common::protocol::RecoveryRequestView;
use uuid::Uuid;

use super::state::RecoveryState;
use crate::crypto::KekDerivation;

/// Exclusive processor lease on a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Claim {
    pub token: Uuid,
    pub until: DateTime<Utc>,
}

impl Claim {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now < self.until
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryRequest {
    pub id: Uuid,
    pub survey_id: String,
    pub requested_by: String,
    pub requested_at: DateTime<Utc>,
    pub state: RecoveryState,
    /// Failed execution attempts so far.
    pub attempts: u32,
    pub claim: Option<Claim>,
    /// Salt and parameters of the new credential's KEK. The KEK itself lives
    /// in the secret store until the request reaches a terminal state.
    pub pending_kek_derivation: KekDerivation,
}

impl RecoveryRequest {
    pub fn new(
        survey_id: &str,
        requested_by: &str,
        now: DateTime<Utc>,
        pending_kek_derivation: KekDerivation,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            survey_id: survey_id.to_owned(),
            requested_by: requested_by.to_owned(),
            requested_at: now,
            state: RecoveryState::Requested,
            attempts: 0,
            claim: None,
            pending_kek_derivation,
        }
    }

    /// Whether a processor currently holds an unexpired claim.
    pub fn is_claimed(&self, now: DateTime<Utc>) -> bool {
        self.claim.is_some_and(|c| c.is_active(now))
    }

    /// Secret store path of the pending KEK.
    pub fn pending_kek_path(&self) -> String {
        pending_kek_path(self.id)
    }

    pub fn view(&self) -> RecoveryRequestView {
        let cols = self.state.to_columns();
        RecoveryRequestView {
            id: self.id,
            survey_id: self.survey_id.clone(),
            requested_by: self.requested_by.clone(),
            state: cols.state,
            requested_at: self.requested_at,
            reviewed_by: cols.reviewed_by,
            reviewed_at: cols.reviewed_at,
            scheduled_execution_at: cols.scheduled_execution_at,
            completed_at: cols.completed_at,
            rejection_reason: cols.rejection_reason,
            failure_reason: cols.failure_reason,
        }
    }
}

pub fn pending_kek_path(request_id: Uuid) -> String {
    format!("recovery/{request_id}/pending-kek")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KdfParams;
    use chrono::Duration;

    #[test]
    fn view_flattens_state() {
        let now = Utc::now();
        let mut req = RecoveryRequest::new(
            "s1",
            "owner-1",
            now,
            KekDerivation::fresh(KdfParams::new(64, 1, 1)),
        );
        req.state = req.state.approve("rev-1", now, Duration::hours(72)).unwrap();
        let view = req.view();
        assert_eq!(view.state, "APPROVED");
        assert_eq!(view.reviewed_by.as_deref(), Some("rev-1"));
        assert_eq!(view.scheduled_execution_at, Some(now + Duration::hours(72)));
        assert!(view.completed_at.is_none());
    }

    #[test]
    fn claim_expires() {
        let now = Utc::now();
        let mut req = RecoveryRequest::new(
            "s1",
            "o",
            now,
            KekDerivation::fresh(KdfParams::default()),
        );
        req.claim = Some(Claim {
            token: Uuid::new_v4(),
            until: now + Duration::minutes(10),
        });
        assert!(req.is_claimed(now));
        assert!(!req.is_claimed(now + Duration::minutes(10)));
        assert!(req.pending_kek_path().ends_with("/pending-kek"));
    }
}
