//! Recovery request rows, including the processor claim columns.
//!
//! Claim and cancellation both go through conditional `UPDATE`s issued inside
//! the caller's `BEGIN IMMEDIATE` transaction, so exactly one of them wins.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::{from_micros, opt_from_micros, to_micros, StoreError};
use crate::recovery::state::{StateColumns, APPROVED};
use crate::recovery::{Claim, RecoveryRequest, RecoveryState};

const COLUMNS: &str = "id, survey_id, requested_by, requested_at, state, reviewed_by, reviewed_at,
    scheduled_execution_at, completed_at, rejection_reason, cancelled_by, cancelled_at,
    failed_at, failure_reason, attempts, claim_token, claimed_until, pending_kek_derivation";

struct RawRequest {
    id: String,
    survey_id: String,
    requested_by: String,
    requested_at: i64,
    state: String,
    reviewed_by: Option<String>,
    reviewed_at: Option<i64>,
    scheduled_execution_at: Option<i64>,
    completed_at: Option<i64>,
    rejection_reason: Option<String>,
    cancelled_by: Option<String>,
    cancelled_at: Option<i64>,
    failed_at: Option<i64>,
    failure_reason: Option<String>,
    attempts: u32,
    claim_token: Option<String>,
    claimed_until: Option<i64>,
    pending_kek_derivation: String,
}

fn raw_from_row(r: &Row<'_>) -> rusqlite::Result<RawRequest> {
    Ok(RawRequest {
        id: r.get(0)?,
        survey_id: r.get(1)?,
        requested_by: r.get(2)?,
        requested_at: r.get(3)?,
        state: r.get(4)?,
        reviewed_by: r.get(5)?,
        reviewed_at: r.get(6)?,
        scheduled_execution_at: r.get(7)?,
        completed_at: r.get(8)?,
        rejection_reason: r.get(9)?,
        cancelled_by: r.get(10)?,
        cancelled_at: r.get(11)?,
        failed_at: r.get(12)?,
        failure_reason: r.get(13)?,
        attempts: r.get(14)?,
        claim_token: r.get(15)?,
        claimed_until: r.get(16)?,
        pending_kek_derivation: r.get(17)?,
    })
}

fn parse_uuid(s: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(s).map_err(|_| StoreError::Corrupt(format!("invalid uuid {s:?}")))
}

impl RawRequest {
    fn decode(self) -> Result<RecoveryRequest, StoreError> {
        let state = RecoveryState::from_columns(StateColumns {
            state: self.state,
            reviewed_by: self.reviewed_by,
            reviewed_at: opt_from_micros(self.reviewed_at)?,
            scheduled_execution_at: opt_from_micros(self.scheduled_execution_at)?,
            completed_at: opt_from_micros(self.completed_at)?,
            rejection_reason: self.rejection_reason,
            cancelled_by: self.cancelled_by,
            cancelled_at: opt_from_micros(self.cancelled_at)?,
            failed_at: opt_from_micros(self.failed_at)?,
            failure_reason: self.failure_reason,
        })
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        let claim = match (self.claim_token, self.claimed_until) {
            (Some(token), Some(until)) => Some(Claim {
                token: parse_uuid(&token)?,
                until: from_micros(until)?,
            }),
            _ => None,
        };

        Ok(RecoveryRequest {
            id: parse_uuid(&self.id)?,
            survey_id: self.survey_id,
            requested_by: self.requested_by,
            requested_at: from_micros(self.requested_at)?,
            state,
            attempts: self.attempts,
            claim,
            pending_kek_derivation: serde_json::from_str(&self.pending_kek_derivation)
                .map_err(|e| StoreError::Corrupt(format!("pending_kek_derivation: {e}")))?,
        })
    }
}

pub fn insert(conn: &Connection, req: &RecoveryRequest) -> Result<(), StoreError> {
    let cols = req.state.to_columns();
    let derivation = serde_json::to_string(&req.pending_kek_derivation)
        .map_err(|e| StoreError::Corrupt(format!("pending_kek_derivation: {e}")))?;
    conn.execute(
        &format!(
            "INSERT INTO recovery_requests ({COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, NULL, NULL, ?16)"
        ),
        params![
            req.id.to_string(),
            req.survey_id,
            req.requested_by,
            to_micros(req.requested_at),
            cols.state,
            cols.reviewed_by,
            cols.reviewed_at.map(to_micros),
            cols.scheduled_execution_at.map(to_micros),
            cols.completed_at.map(to_micros),
            cols.rejection_reason,
            cols.cancelled_by,
            cols.cancelled_at.map(to_micros),
            cols.failed_at.map(to_micros),
            cols.failure_reason,
            req.attempts,
            derivation,
        ],
    )?;
    Ok(())
}

pub fn get(conn: &Connection, id: Uuid) -> Result<Option<RecoveryRequest>, StoreError> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM recovery_requests WHERE id = ?1"),
        params![id.to_string()],
        raw_from_row,
    )
    .optional()?
    .map(RawRequest::decode)
    .transpose()
}

/// Id of the open (`REQUESTED` or `APPROVED`) request for a survey, if any.
pub fn open_for_survey(conn: &Connection, survey_id: &str) -> Result<Option<Uuid>, StoreError> {
    conn.query_row(
        "SELECT id FROM recovery_requests
          WHERE survey_id = ?1 AND state IN ('REQUESTED', 'APPROVED')",
        params![survey_id],
        |r| r.get::<_, String>(0),
    )
    .optional()?
    .map(|id| parse_uuid(&id))
    .transpose()
}

pub fn list_for_survey(conn: &Connection, survey_id: &str) -> Result<Vec<RecoveryRequest>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM recovery_requests WHERE survey_id = ?1 ORDER BY requested_at"
    ))?;
    let raws = stmt
        .query_map(params![survey_id], raw_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    raws.into_iter().map(RawRequest::decode).collect()
}

/// Ids of approved requests whose cooling-off period has elapsed.
pub fn list_due(conn: &Connection, now: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id FROM recovery_requests
          WHERE state = 'APPROVED' AND scheduled_execution_at <= ?1
          ORDER BY scheduled_execution_at",
    )?;
    let ids = stmt
        .query_map(params![to_micros(now)], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    ids.iter().map(|id| parse_uuid(id)).collect()
}

/// Write the state columns of `id`, but only if it is still in
/// `expected_state`. Returns `false` when the guard did not match.
pub fn update_state(
    conn: &Connection,
    id: Uuid,
    expected_state: &str,
    state: &RecoveryState,
) -> Result<bool, StoreError> {
    let cols = state.to_columns();
    let changed = conn.execute(
        "UPDATE recovery_requests
            SET state = ?3, reviewed_by = ?4, reviewed_at = ?5, scheduled_execution_at = ?6,
                completed_at = ?7, rejection_reason = ?8, cancelled_by = ?9, cancelled_at = ?10,
                failed_at = ?11, failure_reason = ?12
          WHERE id = ?1 AND state = ?2",
        params![
            id.to_string(),
            expected_state,
            cols.state,
            cols.reviewed_by,
            cols.reviewed_at.map(to_micros),
            cols.scheduled_execution_at.map(to_micros),
            cols.completed_at.map(to_micros),
            cols.rejection_reason,
            cols.cancelled_by,
            cols.cancelled_at.map(to_micros),
            cols.failed_at.map(to_micros),
            cols.failure_reason,
        ],
    )?;
    Ok(changed == 1)
}

/// Cancel `id` if it is approved, not yet due and not claimed at `now`.
pub fn cancel_unclaimed(
    conn: &Connection,
    id: Uuid,
    state: &RecoveryState,
    now: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let cols = state.to_columns();
    let changed = conn.execute(
        "UPDATE recovery_requests
            SET state = ?2, cancelled_by = ?3, cancelled_at = ?4
          WHERE id = ?1 AND state = 'APPROVED' AND scheduled_execution_at > ?5
            AND (claim_token IS NULL OR claimed_until <= ?5)",
        params![
            id.to_string(),
            cols.state,
            cols.cancelled_by,
            cols.cancelled_at.map(to_micros),
            to_micros(now),
        ],
    )?;
    Ok(changed == 1)
}

/// Take the processor lease on a due, approved, unclaimed request.
pub fn claim(
    conn: &Connection,
    id: Uuid,
    claim: Claim,
    now: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let changed = conn.execute(
        "UPDATE recovery_requests
            SET claim_token = ?2, claimed_until = ?3
          WHERE id = ?1 AND state = ?4 AND scheduled_execution_at <= ?5
            AND (claim_token IS NULL OR claimed_until <= ?5)",
        params![
            id.to_string(),
            claim.token.to_string(),
            to_micros(claim.until),
            APPROVED,
            to_micros(now),
        ],
    )?;
    Ok(changed == 1)
}

/// Drop the lease held under `token`, counting a failed attempt if asked.
pub fn release_claim(
    conn: &Connection,
    id: Uuid,
    token: Uuid,
    count_attempt: bool,
) -> Result<bool, StoreError> {
    let changed = conn.execute(
        "UPDATE recovery_requests
            SET claim_token = NULL, claimed_until = NULL, attempts = attempts + ?3
          WHERE id = ?1 AND claim_token = ?2",
        params![id.to_string(), token.to_string(), u32::from(count_attempt)],
    )?;
    Ok(changed == 1)
}

/// Move a claimed request out of `APPROVED`, but only while `token` still
/// holds the lease. Clears the lease in the same statement.
pub fn finish_claimed(
    conn: &Connection,
    id: Uuid,
    token: Uuid,
    state: &RecoveryState,
    count_attempt: bool,
) -> Result<bool, StoreError> {
    let cols = state.to_columns();
    let changed = conn.execute(
        "UPDATE recovery_requests
            SET state = ?3, completed_at = ?4, failed_at = ?5, failure_reason = ?6,
                claim_token = NULL, claimed_until = NULL, attempts = attempts + ?7
          WHERE id = ?1 AND claim_token = ?2 AND state = 'APPROVED'",
        params![
            id.to_string(),
            token.to_string(),
            cols.state,
            cols.completed_at.map(to_micros),
            cols.failed_at.map(to_micros),
            cols.failure_reason,
            u32::from(count_attempt),
        ],
    )?;
    Ok(changed == 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{KdfParams, KekDerivation};
    use crate::db::Database;
    use chrono::Duration;

    fn request(survey: &str, now: DateTime<Utc>) -> RecoveryRequest {
        RecoveryRequest::new(
            survey,
            "owner-1",
            now,
            KekDerivation::fresh(KdfParams::new(64, 1, 1)),
        )
    }

    fn approved_in_db(db: &Database, now: DateTime<Utc>) -> RecoveryRequest {
        let mut req = request("s1", now);
        db.write(|tx| insert(tx, &req)).unwrap();
        let next = req.state.approve("rev", now, Duration::hours(24)).unwrap();
        assert!(db.write(|tx| update_state(tx, req.id, "REQUESTED", &next)).unwrap());
        req.state = next;
        req
    }

    #[test]
    fn insert_and_load() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();
        let req = request("s1", now);
        db.write(|tx| insert(tx, &req)).unwrap();
        let loaded = db.read(|c| get(c, req.id)).unwrap().unwrap();
        assert_eq!(loaded.survey_id, "s1");
        assert_eq!(loaded.state, RecoveryState::Requested);
        assert_eq!(db.read(|c| open_for_survey(c, "s1")).unwrap(), Some(req.id));
    }

    #[test]
    fn one_open_request_per_survey() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();
        db.write(|tx| insert(tx, &request("s1", now))).unwrap();
        assert!(db.write(|tx| insert(tx, &request("s1", now))).is_err());
        db.write(|tx| insert(tx, &request("s2", now))).unwrap();
    }

    #[test]
    fn requests_cannot_be_deleted() {
        let db = Database::open_in_memory().unwrap();
        db.write(|tx| insert(tx, &request("s1", Utc::now()))).unwrap();
        let res: Result<usize, StoreError> =
            db.write(|tx| Ok(tx.execute("DELETE FROM recovery_requests", [])?));
        assert!(res.is_err());
    }

    #[test]
    fn claim_is_exclusive_and_due_only() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();
        let req = approved_in_db(&db, now);
        let due = now + Duration::hours(25);

        let early = Claim { token: Uuid::new_v4(), until: now + Duration::minutes(10) };
        assert!(!db.write(|tx| claim(tx, req.id, early, now)).unwrap());

        let first = Claim { token: Uuid::new_v4(), until: due + Duration::minutes(10) };
        let second = Claim { token: Uuid::new_v4(), until: due + Duration::minutes(10) };
        assert!(db.write(|tx| claim(tx, req.id, first, due)).unwrap());
        assert!(!db.write(|tx| claim(tx, req.id, second, due)).unwrap());

        // Lease expiry lets another processor take over.
        let later = due + Duration::minutes(11);
        assert!(db.write(|tx| claim(tx, req.id, second, later)).unwrap());
        assert!(!db.write(|tx| release_claim(tx, req.id, first.token, true)).unwrap());
        assert!(db.write(|tx| release_claim(tx, req.id, second.token, true)).unwrap());

        let loaded = db.read(|c| get(c, req.id)).unwrap().unwrap();
        assert_eq!(loaded.attempts, 1);
        assert!(loaded.claim.is_none());
    }

    #[test]
    fn cancel_loses_to_active_claim() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();
        let req = approved_in_db(&db, now);
        let at = now + Duration::hours(1);
        let cancelled = req.state.cancel("owner-1", at).unwrap();

        // Force a live claim onto the not-yet-due request.
        db.write(|tx| {
            tx.execute(
                "UPDATE recovery_requests SET claim_token = 'x', claimed_until = ?2 WHERE id = ?1",
                params![req.id.to_string(), to_micros(at + Duration::minutes(5))],
            )
            .map_err(StoreError::from)
        })
        .unwrap();
        assert!(!db.write(|tx| cancel_unclaimed(tx, req.id, &cancelled, at)).unwrap());
    }

    #[test]
    fn finish_requires_lease() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();
        let req = approved_in_db(&db, now);
        let due = now + Duration::hours(24);
        let lease = Claim { token: Uuid::new_v4(), until: due + Duration::minutes(10) };
        assert!(db.write(|tx| claim(tx, req.id, lease, due)).unwrap());

        let done = req.state.complete(due).unwrap();
        assert!(!db.write(|tx| finish_claimed(tx, req.id, Uuid::new_v4(), &done, false)).unwrap());
        assert!(db.write(|tx| finish_claimed(tx, req.id, lease.token, &done, false)).unwrap());
        // Replaying the same completion is a no-op.
        assert!(!db.write(|tx| finish_claimed(tx, req.id, lease.token, &done, false)).unwrap());

        let loaded = db.read(|c| get(c, req.id)).unwrap().unwrap();
        assert_eq!(loaded.state, done);
        assert!(db.read(|c| list_due(c, due)).unwrap().is_empty());
    }
}
