//! Survey registration and audited key destruction.

use chrono::{DateTime, Utc};
use common::protocol::Tier;
use rusqlite::Connection;
use thiserror::Error;
use tracing::info;

use crate::actor::{Actor, Role};
use crate::audit::{AuditAction, AuditError, AuditEvent, Auditor};
use crate::db::{self, Database, StoreError};

/// A data container whose responses are encrypted under one DEK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Survey {
    pub id: String,
    pub tier: Tier,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum SurveyError {
    #[error("{0}")]
    PolicyViolation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("invalid survey id {0:?}")]
    InvalidId(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Audit(#[from] AuditError),
}

fn validate_id(survey_id: &str) -> Result<(), SurveyError> {
    let ok = !survey_id.is_empty()
        && survey_id.len() <= 128
        && survey_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'));
    if ok {
        Ok(())
    } else {
        Err(SurveyError::InvalidId(survey_id.to_owned()))
    }
}

/// Register `survey_id` with `tier` inside the caller's transaction.
///
/// Registering again with the same tier is a no-op. The tier may change
/// only while no key record exists.
///
/// # Errors
///
/// Returns [`SurveyError::PolicyViolation`] when the tier would change on a
/// survey that already has keys.
pub fn register_survey(
    conn: &Connection,
    survey_id: &str,
    tier: Tier,
    now: DateTime<Utc>,
) -> Result<Survey, SurveyError> {
    validate_id(survey_id)?;
    match db::keys::get_survey(conn, survey_id)? {
        Some(existing) if existing.tier == tier => Ok(existing),
        Some(existing) => {
            if db::keys::get_key_record(conn, survey_id)?.is_some() {
                return Err(SurveyError::PolicyViolation(format!(
                    "survey {survey_id} is {} and its tier can no longer change",
                    existing.tier
                )));
            }
            db::keys::update_survey_tier(conn, survey_id, tier)?;
            Ok(Survey { tier, ..existing })
        }
        None => {
            let survey = Survey {
                id: survey_id.to_owned(),
                tier,
                created_at: now,
            };
            db::keys::insert_survey(conn, &survey)?;
            Ok(survey)
        }
    }
}

/// Remove a survey's key record and escrow shares in one audited
/// transaction. Recovery requests are retained.
///
/// Every ciphertext produced under the survey becomes permanently unreadable.
pub fn destroy_survey_keys(
    db: &Database,
    actor: &Actor,
    survey_id: &str,
    now: DateTime<Utc>,
) -> Result<usize, SurveyError> {
    if !matches!(actor.role, Role::Owner | Role::Operator) {
        return Err(SurveyError::Forbidden(format!(
            "{} may not destroy survey keys",
            actor.role.as_str()
        )));
    }
    let shares = db.write(|tx| {
        let shares = db::keys::delete_escrow_shares(tx, survey_id)?;
        if db::keys::delete_key_record(tx, survey_id)? == 0 {
            return Err(SurveyError::NotFound(format!("key record for survey {survey_id}")));
        }
        Auditor::record_tx(
            tx,
            AuditEvent::success(&actor.id, AuditAction::KeysDestroyed, survey_id, now)
                .with_detail(format!("{shares} escrow shares removed")),
        )?;
        Ok(shares)
    })?;
    info!(survey_id, shares, "survey keys destroyed");
    Ok(shares)
}
