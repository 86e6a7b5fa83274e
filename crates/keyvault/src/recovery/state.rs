//! The recovery request state machine.
//!
//! ```text
//! REQUESTED ──approve──▶ APPROVED ──complete──▶ COMPLETED
//!     │                     │  ╰────fail─────▶ FAILED
//!     ╰──reject──▶ REJECTED ╰────cancel──────▶ CANCELLED
//! ```
//!
//! Every state carries exactly the data that exists in it, and a
//! [`Completion`] can only be produced by [`Approval::complete`], which
//! refuses to run before the scheduled execution time.

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

pub const REQUESTED: &str = "REQUESTED";
pub const APPROVED: &str = "APPROVED";
pub const REJECTED: &str = "REJECTED";
pub const CANCELLED: &str = "CANCELLED";
pub const COMPLETED: &str = "COMPLETED";
pub const FAILED: &str = "FAILED";

/// Errors produced by state transitions.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("invalid transition from {from_state} via {event}")]
    InvalidTransition {
        from_state: &'static str,
        event: &'static str,
    },

    /// Completion attempted before the cooling-off period elapsed.
    #[error("request is not due until {scheduled_execution_at}")]
    NotYetDue {
        scheduled_execution_at: DateTime<Utc>,
    },

    /// Cancellation attempted at or after the scheduled execution time.
    #[error("cancellation window closed at {scheduled_execution_at}")]
    CancelWindowClosed {
        scheduled_execution_at: DateTime<Utc>,
    },

    #[error("a rejection reason is required")]
    MissingReason,

    /// Approval time plus cooling-off does not fit in a timestamp.
    #[error("cooling-off period of {cooling_off_secs}s is out of range")]
    ScheduleOutOfRange { cooling_off_secs: i64 },
}

/// Reviewer approval and the resulting execution schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Approval {
    pub reviewed_by: String,
    pub reviewed_at: DateTime<Utc>,
    pub scheduled_execution_at: DateTime<Utc>,
}

impl Approval {
    /// Complete the approved request at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError::NotYetDue`] if `now < scheduled_execution_at`.
    pub fn complete(&self, now: DateTime<Utc>) -> Result<Completion, TransitionError> {
        if now < self.scheduled_execution_at {
            return Err(TransitionError::NotYetDue {
                scheduled_execution_at: self.scheduled_execution_at,
            });
        }
        Ok(Completion {
            approval: self.clone(),
            completed_at: now,
        })
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.scheduled_execution_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub reviewed_by: String,
    pub reviewed_at: DateTime<Utc>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cancellation {
    pub approval: Approval,
    pub cancelled_by: String,
    pub cancelled_at: DateTime<Utc>,
}

/// Proof that an approved request was executed no earlier than scheduled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    approval: Approval,
    completed_at: DateTime<Utc>,
}

impl Completion {
    pub fn approval(&self) -> &Approval {
        &self.approval
    }

    pub fn completed_at(&self) -> DateTime<Utc> {
        self.completed_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub approval: Approval,
    pub failed_at: DateTime<Utc>,
    /// Reviewer-visible reason. Never contains key material.
    pub reason: String,
}

/// Current state of a recovery request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryState {
    Requested,
    Approved(Approval),
    Rejected(Rejection),
    Cancelled(Cancellation),
    Completed(Completion),
    Failed(Failure),
}

impl RecoveryState {
    /// Persisted state name.
    pub fn name(&self) -> &'static str {
        match self {
            RecoveryState::Requested => REQUESTED,
            RecoveryState::Approved(_) => APPROVED,
            RecoveryState::Rejected(_) => REJECTED,
            RecoveryState::Cancelled(_) => CANCELLED,
            RecoveryState::Completed(_) => COMPLETED,
            RecoveryState::Failed(_) => FAILED,
        }
    }

    /// `REQUESTED` and `APPROVED` requests block new requests for the survey.
    pub fn is_open(&self) -> bool {
        matches!(self, RecoveryState::Requested | RecoveryState::Approved(_))
    }

    pub fn approval(&self) -> Option<&Approval> {
        match self {
            RecoveryState::Approved(a) => Some(a),
            RecoveryState::Cancelled(c) => Some(&c.approval),
            RecoveryState::Completed(c) => Some(&c.approval),
            RecoveryState::Failed(f) => Some(&f.approval),
            RecoveryState::Requested | RecoveryState::Rejected(_) => None,
        }
    }

    fn invalid(&self, event: &'static str) -> TransitionError {
        TransitionError::InvalidTransition {
            from_state: self.name(),
            event,
        }
    }

    /// `REQUESTED → APPROVED`, scheduling execution after `cooling_off`.
    pub fn approve(
        &self,
        reviewer: &str,
        now: DateTime<Utc>,
        cooling_off: Duration,
    ) -> Result<Self, TransitionError> {
        match self {
            RecoveryState::Requested => {
                let scheduled_execution_at = now.checked_add_signed(cooling_off).ok_or(
                    TransitionError::ScheduleOutOfRange {
                        cooling_off_secs: cooling_off.num_seconds(),
                    },
                )?;
                Ok(RecoveryState::Approved(Approval {
                    reviewed_by: reviewer.to_owned(),
                    reviewed_at: now,
                    scheduled_execution_at,
                }))
            }
            other => Err(other.invalid("approve")),
        }
    }

    /// `REQUESTED → REJECTED`. `reason` must not be blank.
    pub fn reject(
        &self,
        reviewer: &str,
        now: DateTime<Utc>,
        reason: &str,
    ) -> Result<Self, TransitionError> {
        match self {
            RecoveryState::Requested => {
                let reason = reason.trim();
                if reason.is_empty() {
                    return Err(TransitionError::MissingReason);
                }
                Ok(RecoveryState::Rejected(Rejection {
                    reviewed_by: reviewer.to_owned(),
                    reviewed_at: now,
                    reason: reason.to_owned(),
                }))
            }
            other => Err(other.invalid("reject")),
        }
    }

    /// `APPROVED → CANCELLED`, only strictly before the scheduled execution.
    pub fn cancel(&self, by: &str, now: DateTime<Utc>) -> Result<Self, TransitionError> {
        match self {
            RecoveryState::Approved(approval) => {
                if approval.is_due(now) {
                    return Err(TransitionError::CancelWindowClosed {
                        scheduled_execution_at: approval.scheduled_execution_at,
                    });
                }
                Ok(RecoveryState::Cancelled(Cancellation {
                    approval: approval.clone(),
                    cancelled_by: by.to_owned(),
                    cancelled_at: now,
                }))
            }
            other => Err(other.invalid("cancel")),
        }
    }

    /// `APPROVED → COMPLETED`.
    pub fn complete(&self, now: DateTime<Utc>) -> Result<Self, TransitionError> {
        match self {
            RecoveryState::Approved(approval) => approval.complete(now).map(RecoveryState::Completed),
            other => Err(other.invalid("complete")),
        }
    }

    /// `APPROVED → FAILED`.
    pub fn fail(&self, now: DateTime<Utc>, reason: &str) -> Result<Self, TransitionError> {
        match self {
            RecoveryState::Approved(approval) => Ok(RecoveryState::Failed(Failure {
                approval: approval.clone(),
                failed_at: now,
                reason: reason.to_owned(),
            })),
            other => Err(other.invalid("fail")),
        }
    }

    // -----------------------------------------------------------------------
    // Column mapping
    // -----------------------------------------------------------------------

    pub fn to_columns(&self) -> StateColumns {
        let mut cols = StateColumns {
            state: self.name().to_owned(),
            ..StateColumns::default()
        };
        if let Some(a) = self.approval() {
            cols.reviewed_by = Some(a.reviewed_by.clone());
            cols.reviewed_at = Some(a.reviewed_at);
            cols.scheduled_execution_at = Some(a.scheduled_execution_at);
        }
        match self {
            RecoveryState::Rejected(r) => {
                cols.reviewed_by = Some(r.reviewed_by.clone());
                cols.reviewed_at = Some(r.reviewed_at);
                cols.rejection_reason = Some(r.reason.clone());
            }
            RecoveryState::Cancelled(c) => {
                cols.cancelled_by = Some(c.cancelled_by.clone());
                cols.cancelled_at = Some(c.cancelled_at);
            }
            RecoveryState::Completed(c) => cols.completed_at = Some(c.completed_at),
            RecoveryState::Failed(f) => {
                cols.failed_at = Some(f.failed_at);
                cols.failure_reason = Some(f.reason.clone());
            }
            RecoveryState::Requested | RecoveryState::Approved(_) => {}
        }
        cols
    }

    /// Rebuild a state from its persisted columns, re-checking invariants.
    pub fn from_columns(cols: StateColumns) -> Result<Self, InvalidStateColumns> {
        let missing = |field: &str| InvalidStateColumns(format!("{} without {field}", cols.state));

        let approval = || -> Result<Approval, InvalidStateColumns> {
            Ok(Approval {
                reviewed_by: cols.reviewed_by.clone().ok_or_else(|| missing("reviewed_by"))?,
                reviewed_at: cols.reviewed_at.ok_or_else(|| missing("reviewed_at"))?,
                scheduled_execution_at: cols
                    .scheduled_execution_at
                    .ok_or_else(|| missing("scheduled_execution_at"))?,
            })
        };

        match cols.state.as_str() {
            REQUESTED => Ok(RecoveryState::Requested),
            APPROVED => Ok(RecoveryState::Approved(approval()?)),
            REJECTED => Ok(RecoveryState::Rejected(Rejection {
                reviewed_by: cols.reviewed_by.clone().ok_or_else(|| missing("reviewed_by"))?,
                reviewed_at: cols.reviewed_at.ok_or_else(|| missing("reviewed_at"))?,
                reason: cols
                    .rejection_reason
                    .clone()
                    .ok_or_else(|| missing("rejection_reason"))?,
            })),
            CANCELLED => Ok(RecoveryState::Cancelled(Cancellation {
                approval: approval()?,
                cancelled_by: cols.cancelled_by.clone().ok_or_else(|| missing("cancelled_by"))?,
                cancelled_at: cols.cancelled_at.ok_or_else(|| missing("cancelled_at"))?,
            })),
            COMPLETED => {
                let completed_at = cols.completed_at.ok_or_else(|| missing("completed_at"))?;
                approval()?
                    .complete(completed_at)
                    .map(RecoveryState::Completed)
                    .map_err(|e| InvalidStateColumns(e.to_string()))
            }
            FAILED => Ok(RecoveryState::Failed(Failure {
                approval: approval()?,
                failed_at: cols.failed_at.ok_or_else(|| missing("failed_at"))?,
                reason: cols
                    .failure_reason
                    .clone()
                    .ok_or_else(|| missing("failure_reason"))?,
            })),
            other => Err(InvalidStateColumns(format!("unknown state {other:?}"))),
        }
    }
}

/// Flat column form of a [`RecoveryState`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateColumns {
    pub state: String,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub scheduled_execution_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
    pub cancelled_by: Option<String>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid persisted recovery state: {0}")]
pub struct InvalidStateColumns(String);
